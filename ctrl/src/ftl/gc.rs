/// Garbage collector.
///
/// Channels flagged by the provisioner are collected once their in-flight
/// host I/Os drain. Victims are the closed blocks with the highest invalid
/// sector counts (bucket-sorted, floored by the configured target rate and
/// a fill-dependent minimum). Valid sectors are read out, re-laid with
/// namespace data first and map pages page-aligned at the tail, written
/// through the global provisioner, and re-bound in the mapping layer; any
/// failure rolls the block's moves back. A fully-invalid block recycles
/// without touching the map at all.
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::FtlConfig;
use crate::ftl::blk_md::{self, Grain};
use crate::ftl::{AppFtl, FtlChannel, FtlError, PgOob, PgType};
use crate::mmgr::MediaIoCmd;
use crate::ppa::Ppa;

/// One valid sector lifted out of a victim block.
struct SecMove {
    lba: u64,
    old_ppa: Ppa,
    data: Vec<u8>,
}

/// One whole map page lifted out of a victim block.
struct MapMove {
    first_lba: u64,
    old_base: Ppa,
    data: Vec<u8>,
}

/// A completed re-bind, kept for rollback.
enum Moved {
    Sec { lba: u64, old: Ppa, new: Ppa },
    MapPg { first_lba: u64, old: Ppa, new: Ppa },
}

pub struct Gc {
    thresd: f32,
    target_rate: f32,
    max_blks: usize,
    parallel_ch: usize,
    pub recycled_blks: AtomicU64,
    pub moved_secs: AtomicU64,
}

impl Gc {
    pub fn new(cfg: &FtlConfig) -> Self {
        Self {
            thresd: cfg.gc_thresd,
            target_rate: cfg.gc_target_rate,
            max_blks: cfg.gc_max_blks,
            parallel_ch: cfg.gc_parallel_ch,
            recycled_blks: AtomicU64::new(0),
            moved_secs: AtomicU64::new(0),
        }
    }

    /// One collection pass over the channels that asked for it. Channels
    /// with host I/O still in flight are left for a later pass; a channel
    /// is only deactivated once quiescent. Returns blocks recycled.
    pub fn run_pass(&self, ftl: &AppFtl) -> usize {
        let mut recycled = 0;
        let mut ran = 0;

        for ch in &ftl.channels {
            if ran == self.parallel_ch {
                break;
            }
            if !ch.need_gc() {
                continue;
            }
            if ch.nthreads() > 0 {
                // Busy references pin the channel; collect later.
                continue;
            }
            ch.active_unset();
            ran += 1;

            let victims = self.get_target_blks(ftl, ch);
            log::info!(
                "[gc] ch {}: collecting {} block(s)",
                ch.id,
                victims.len()
            );
            for (lun, blk) in victims {
                match self.recycle_blk(ftl, ch, lun, blk) {
                    Ok(()) => {
                        recycled += 1;
                        self.recycled_blks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::warn!(
                            "[gc] ch {}: recycle of lun {} blk {} failed: {}",
                            ch.id,
                            lun,
                            blk,
                            e
                        );
                    }
                }
            }

            ch.need_gc_unset();
            if ch.prov.nfree() > 0 {
                ch.active_set();
            } else {
                // Nothing freed; leave the flag for the next pass.
                ch.need_gc_set();
            }
        }
        recycled
    }

    /// Pick victim blocks: closed blocks bucket-sorted by invalid sectors,
    /// emitted from the most invalid down while they stay above both the
    /// fill-dependent minimum and the target-rate floor.
    pub fn get_target_blks(&self, _ftl: &AppFtl, ch: &FtlChannel) -> Vec<(u8, u16)> {
        let sec_per_blk = ch.geo.sec_per_blk() as usize;

        let nfree = ch.prov.nfree();
        let nused = ch.prov.nused();
        let used_rate = if nfree + nused == 0 {
            1.0
        } else {
            nused as f32 / (nfree + nused) as f32
        };

        let cap = sec_per_blk as f32 * self.target_rate;
        let mut min_invalid = cap * (1.0 - (used_rate - self.thresd) / (1.0 - self.thresd));
        if min_invalid > cap {
            min_invalid = cap;
        }

        let mut buckets: Vec<Vec<(u8, u16)>> = vec![Vec::new(); sec_per_blk + 1];
        {
            let md = ch.blk_md.lock();
            for lun in 0..ch.geo.lun_per_ch {
                for ent in md.lun_row(lun) {
                    if ent.is_closed(&ch.geo) {
                        let inv = (ent.invalid_sec as usize).min(sec_per_blk);
                        buckets[inv].push((ent.ppa.lun(), ent.ppa.blk()));
                    }
                }
            }
        }

        let mut out = Vec::new();
        for inv in (0..=sec_per_blk).rev() {
            if (inv as f32) < min_invalid {
                break;
            }
            if (inv as f32) / (sec_per_blk as f32) < self.target_rate {
                break;
            }
            for &victim in &buckets[inv] {
                if out.len() == self.max_blks {
                    return out;
                }
                out.push(victim);
            }
        }
        out
    }

    /// Copy-forward one block and hand it back to the provisioner.
    fn recycle_blk(
        &self,
        ftl: &AppFtl,
        ch: &FtlChannel,
        lun: u8,
        blk: u16,
    ) -> Result<(), FtlError> {
        let geo = &ch.geo;
        let (ns_secs, map_pgs) = self.lift_valid(ftl, ch, lun, blk)?;

        if ns_secs.is_empty() && map_pgs.is_empty() {
            // Nothing valid: the block goes straight back, no map traffic.
            return ch.prov.put_block(ch, lun, blk);
        }

        let spp = geo.sec_per_pl_pg() as usize;
        let sec_sz = geo.sec_size() as usize;
        let mut moved: Vec<Moved> = Vec::new();

        // Namespace sectors first, packed plane-page by plane-page.
        let mut cursor = 0;
        while cursor < ns_secs.len() {
            let batch = &ns_secs[cursor..(cursor + spp).min(ns_secs.len())];
            if let Err(e) = self.relocate_ns_page(ftl, ch, batch, sec_sz, &mut moved) {
                self.rollback(ftl, &moved);
                return Err(e);
            }
            cursor += batch.len();
        }

        // Map pages page-aligned at the tail.
        for mp in &map_pgs {
            if let Err(e) = self.relocate_map_page(ftl, ch, mp, &mut moved) {
                self.rollback(ftl, &moved);
                return Err(e);
            }
        }

        self.moved_secs
            .fetch_add(ns_secs.len() as u64, Ordering::Relaxed);
        ch.prov.put_block(ch, lun, blk)
    }

    /// Read every page of the victim holding valid sectors and classify
    /// them by the per-sector OOB record.
    fn lift_valid(
        &self,
        _ftl: &AppFtl,
        ch: &FtlChannel,
        lun: u8,
        blk: u16,
    ) -> Result<(Vec<SecMove>, Vec<MapMove>), FtlError> {
        let geo = &ch.geo;
        let mut ns_secs = Vec::new();
        let mut map_pgs = Vec::new();

        for pg in 0..geo.pg_per_blk {
            // Validity snapshot per plane for this page.
            let valid: Vec<Vec<bool>> = {
                let md = ch.blk_md.lock();
                let ent = md.get(lun, blk);
                (0..geo.n_of_planes)
                    .map(|pl| {
                        (0..geo.sec_per_pg as u8)
                            .map(|sec| !ent.sec_invalid(geo, pg, pl, sec))
                            .collect()
                    })
                    .collect()
            };
            if !valid.iter().flatten().any(|&v| v) {
                continue;
            }

            let cmds = (0..geo.n_of_planes)
                .map(|pl| MediaIoCmd::read_page(Ppa::new(ch.mmgr_id, lun, pl, blk, pg, 0), geo))
                .collect();
            let mut done = ch.sync.multi(cmds)?;
            done.sort_by_key(|c| c.ppa.pl());

            // A map page spans the whole plane-page; the first sector's OOB
            // decides.
            let first_oob = PgOob::from_bytes(done[0].sector_oob(geo, 0));
            if first_oob.pg_type == PgType::Map {
                let mut data = Vec::with_capacity(geo.pl_pg_size() as usize);
                for cmd in &done {
                    data.extend_from_slice(&cmd.data[..geo.pg_size as usize]);
                }
                map_pgs.push(MapMove {
                    first_lba: first_oob.lba,
                    old_base: Ppa::new(ch.mmgr_id, lun, 0, blk, pg, 0),
                    data,
                });
                continue;
            }

            for (pl, cmd) in done.iter().enumerate() {
                for sec in 0..geo.sec_per_pg as usize {
                    if !valid[pl][sec] {
                        continue;
                    }
                    let oob = PgOob::from_bytes(cmd.sector_oob(geo, sec));
                    if oob.pg_type != PgType::Namespace {
                        continue;
                    }
                    ns_secs.push(SecMove {
                        lba: oob.lba,
                        old_ppa: Ppa::new(ch.mmgr_id, lun, pl as u8, blk, pg, sec as u8),
                        data: cmd.sector(geo, sec).to_vec(),
                    });
                }
            }
        }
        Ok((ns_secs, map_pgs))
    }

    /// One plane-page allocation for relocated data. Normally served by the
    /// global provisioner so copies spread over the other channels; when no
    /// other channel is active (the collected one is deactivated for the
    /// pass), the copies land back on the collected channel itself.
    fn alloc_page(
        &self,
        ftl: &AppFtl,
        src: &FtlChannel,
    ) -> Result<(Ppa, Option<crate::ftl::gl_prov::ProvPpas>), FtlError> {
        match ftl.gl_prov.get_ppa_list(ftl, 1) {
            Ok(prov) => Ok((prov.ppas[0], Some(prov))),
            Err(_) => {
                let mut out = Vec::new();
                src.prov.get_ppas(src, 1, &mut out)?;
                Ok((out[0], None))
            }
        }
    }

    fn release_page(&self, ftl: &AppFtl, prov: Option<crate::ftl::gl_prov::ProvPpas>) {
        if let Some(p) = prov {
            ftl.gl_prov.free_ppa_list(ftl, p);
        }
    }

    /// Write one plane-page of namespace sectors (padded at the tail) and
    /// re-bind each one, serialized against host upserts. A sector the host
    /// rewrote meanwhile is left alone and its fresh copy invalidated.
    fn relocate_ns_page(
        &self,
        ftl: &AppFtl,
        src: &FtlChannel,
        batch: &[SecMove],
        sec_sz: usize,
        moved: &mut Vec<Moved>,
    ) -> Result<(), FtlError> {
        let (base, prov) = self.alloc_page(ftl, src)?;
        let dst = &ftl.channels[base.ch() as usize];
        let geo = &dst.geo;
        let buf_sz = (geo.pg_size + geo.pg_oob_sz()) as usize;

        let mut cmds = Vec::with_capacity(geo.n_of_planes as usize);
        for pl in 0..geo.n_of_planes as usize {
            let mut buf = vec![0u8; buf_sz];
            for sec in 0..geo.sec_per_pg as usize {
                let idx = pl * geo.sec_per_pg as usize + sec;
                let oob = if idx < batch.len() {
                    buf[sec * sec_sz..(sec + 1) * sec_sz].copy_from_slice(&batch[idx].data);
                    PgOob {
                        lba: batch[idx].lba,
                        pg_type: PgType::Namespace,
                    }
                } else {
                    PgOob {
                        lba: 0,
                        pg_type: PgType::Padding,
                    }
                };
                let rec = oob.to_bytes();
                let off = geo.pg_size as usize + sec * geo.sec_oob_sz as usize;
                buf[off..off + rec.len()].copy_from_slice(&rec);
            }
            cmds.push(MediaIoCmd::write_page(base.with_pl(pl as u8), geo, buf));
        }

        if let Err(e) = dst.sync.multi(cmds) {
            blk_md::invalidate(dst, base, Grain::Page);
            self.release_page(ftl, prov);
            return Err(e.into());
        }
        self.release_page(ftl, prov);

        for (idx, mv) in batch.iter().enumerate() {
            let pl = (idx / geo.sec_per_pg as usize) as u8;
            let sec = (idx % geo.sec_per_pg as usize) as u8;
            let new_ppa = base.with_pl(pl).with_sec(sec);

            let _ns = ftl.ns_mutex.lock();
            let cur = ftl.gl_map.read(ftl, mv.lba)?;
            if cur != mv.old_ppa {
                // Rewritten while we copied; the lifted copy is stale.
                drop(_ns);
                blk_md::invalidate(dst, new_ppa, Grain::Sector);
                continue;
            }
            ftl.gl_map.upsert(ftl, mv.lba, new_ppa)?;
            moved.push(Moved::Sec {
                lba: mv.lba,
                old: mv.old_ppa,
                new: new_ppa,
            });
        }

        // Tail padding of the last page is dead on arrival.
        for idx in batch.len()..geo.sec_per_pl_pg() as usize {
            let pl = (idx / geo.sec_per_pg as usize) as u8;
            let sec = (idx % geo.sec_per_pg as usize) as u8;
            blk_md::invalidate(dst, base.with_pl(pl).with_sec(sec), Grain::Sector);
        }
        Ok(())
    }

    /// Rewrite one map page and re-point its directory slot; only the page
    /// base (first sector) carries the binding.
    fn relocate_map_page(
        &self,
        ftl: &AppFtl,
        src: &FtlChannel,
        mp: &MapMove,
        moved: &mut Vec<Moved>,
    ) -> Result<(), FtlError> {
        let (base, prov) = self.alloc_page(ftl, src)?;
        let dst = &ftl.channels[base.ch() as usize];
        let geo = &dst.geo;
        let buf_sz = (geo.pg_size + geo.pg_oob_sz()) as usize;
        let pg_sz = geo.pg_size as usize;

        let oob_rec = PgOob {
            lba: mp.first_lba,
            pg_type: PgType::Map,
        }
        .to_bytes();

        let mut cmds = Vec::with_capacity(geo.n_of_planes as usize);
        for pl in 0..geo.n_of_planes as usize {
            let mut buf = vec![0u8; buf_sz];
            let start = pl * pg_sz;
            if start < mp.data.len() {
                let take = pg_sz.min(mp.data.len() - start);
                buf[..take].copy_from_slice(&mp.data[start..start + take]);
            }
            for sec in 0..geo.sec_per_pg as usize {
                let off = pg_sz + sec * geo.sec_oob_sz as usize;
                buf[off..off + oob_rec.len()].copy_from_slice(&oob_rec);
            }
            cmds.push(MediaIoCmd::write_page(base.with_pl(pl as u8), geo, buf));
        }

        if let Err(e) = dst.sync.multi(cmds) {
            blk_md::invalidate(dst, base, Grain::Page);
            self.release_page(ftl, prov);
            return Err(e.into());
        }
        self.release_page(ftl, prov);

        match ftl.gl_map.upsert_md(ftl, mp.first_lba, mp.old_base, base) {
            Ok(()) => {
                moved.push(Moved::MapPg {
                    first_lba: mp.first_lba,
                    old: mp.old_base,
                    new: base,
                });
                Ok(())
            }
            Err(FtlError::MapMismatch) => {
                // The page moved under us (a cache eviction rewrote it);
                // this copy is stale.
                blk_md::invalidate(dst, base, Grain::Page);
                Ok(())
            }
            Err(e) => {
                blk_md::invalidate(dst, base, Grain::Page);
                Err(e)
            }
        }
    }

    /// Undo every re-bind performed for the current victim and flag the
    /// fresh copies invalid.
    fn rollback(&self, ftl: &AppFtl, moved: &[Moved]) {
        log::error!("[gc] rolling back {} move(s)", moved.len());
        for m in moved.iter().rev() {
            match *m {
                Moved::Sec { lba, old, new } => {
                    let _ns = ftl.ns_mutex.lock();
                    if ftl.gl_map.upsert(ftl, lba, old).is_err() {
                        log::error!("[gc] rollback failed for lba {}", lba);
                    }
                    drop(_ns);
                    let ch = &ftl.channels[new.ch() as usize];
                    blk_md::invalidate(ch, new, Grain::Sector);
                }
                Moved::MapPg {
                    first_lba,
                    old,
                    new,
                } => {
                    if ftl.gl_map.upsert_md(ftl, first_lba, new, old).is_err() {
                        log::error!("[gc] rollback failed for map page {}", first_lba);
                    }
                    let ch = &ftl.channels[new.ch() as usize];
                    blk_md::invalidate(ch, new, Grain::Page);
                }
            }
        }
    }
}
