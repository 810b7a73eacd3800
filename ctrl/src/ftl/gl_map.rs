/// Global logical-to-physical mapping.
///
/// The table holds one `(lba, ppa)` entry per namespace sector, packed into
/// map pages sized to a plane-page and spread over the channels round-robin.
/// Each channel caches a handful of its own map pages; pages are demand
/// loaded, kept in LRU order and flushed through the global provisioner on
/// eviction, so mapping I/O follows the same placement policy as user data.
///
/// Locking: a page's directory-slot mutex serializes load and eviction of
/// that page; the cache's list lock is only held for structural churn.
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::FtlConfig;
use crate::ftl::blk_md::{self, Grain};
use crate::ftl::ch_map::{self, DirSlot, MapDirectory, MapEntry, MAP_ENTRY_SZ};
use crate::ftl::{AppFtl, FtlChannel, FtlError, PgOob, PgType};
use crate::mmgr::MediaIoCmd;
use crate::ppa::Ppa;

use alloc::sync::Arc;

pub struct MapCacheEntry {
    pub dirty: bool,
    pub buf: Vec<u8>,
    /// Where this page lives on media (unmapped for a page never written).
    pub ppa: Ppa,
    /// Directory slot currently backed by this entry.
    pub md_slot: Option<usize>,
}

struct CacheLists {
    free: Vec<usize>,
    used: VecDeque<usize>,
}

/// Fixed pool of page buffers for one channel. Free entries stack LIFO;
/// used entries queue FIFO with the most recently touched at the tail.
pub struct MapCache {
    pub entries: Vec<Mutex<MapCacheEntry>>,
    lists: Mutex<CacheLists>,
}

impl MapCache {
    pub fn new(n_entries: usize, buf_sz: usize) -> Self {
        let mut entries = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            entries.push(Mutex::new(MapCacheEntry {
                dirty: false,
                buf: vec![0u8; buf_sz],
                ppa: Ppa::UNMAPPED,
                md_slot: None,
            }));
        }
        Self {
            entries,
            lists: Mutex::new(CacheLists {
                free: (0..n_entries).collect(),
                used: VecDeque::new(),
            }),
        }
    }

    pub fn nfree(&self) -> usize {
        self.lists.lock().free.len()
    }

    pub fn nused(&self) -> usize {
        self.lists.lock().used.len()
    }

    fn pop_free(&self) -> Option<usize> {
        self.lists.lock().free.pop()
    }

    fn push_free(&self, idx: usize) {
        self.lists.lock().free.push(idx);
    }

    fn push_used(&self, idx: usize) {
        self.lists.lock().used.push_back(idx);
    }

    fn push_used_front(&self, idx: usize) {
        self.lists.lock().used.push_front(idx);
    }

    fn touch(&self, idx: usize) {
        let mut lists = self.lists.lock();
        if let Some(at) = lists.used.iter().position(|&u| u == idx) {
            let _ = lists.used.remove(at);
            lists.used.push_back(idx);
        }
    }

    fn lru(&self) -> Option<usize> {
        self.lists.lock().used.front().copied()
    }

    fn remove_used(&self, idx: usize) {
        let mut lists = self.lists.lock();
        if let Some(at) = lists.used.iter().position(|&u| u == idx) {
            let _ = lists.used.remove(at);
        }
    }
}

pub struct GlMap {
    /// Map entries per map page, uniform across channels (smallest
    /// plane-page wins).
    pub ent_per_pg: u64,
}

impl GlMap {
    /// Size the map layout, build per-channel directories (loading persisted
    /// copies where present) and allocate the caches.
    pub fn init(cfg: &FtlConfig, channels: &[Arc<FtlChannel>]) -> Result<GlMap, FtlError> {
        let nch = channels.len() as u64;
        let mut pl_pg = u32::MAX;
        let mut ns_sectors = 0u64;
        for ch in channels {
            pl_pg = pl_pg.min(ch.geo.pl_pg_size());
            ns_sectors += ch.ns_sectors;
        }
        let ent_per_pg = (pl_pg as usize / MAP_ENTRY_SZ) as u64;
        if ent_per_pg == 0 || (ent_per_pg as usize * MAP_ENTRY_SZ) > cfg.map_buf_pg_sz {
            return Err(FtlError::MetaOverflow);
        }

        let total_pgs = (ns_sectors + ent_per_pg - 1) / ent_per_pg;
        for (i, ch) in channels.iter().enumerate() {
            let n_slots = ((total_pgs + nch - 1 - i as u64) / nch) as usize;
            let dir = MapDirectory::new(n_slots, i as u16, nch as u16);
            let fresh = ch_map::load(ch, &dir)?;
            ch.map_md.call_once(|| dir);
            if fresh {
                ch_map::flush(ch)?;
            }
            ch.map_cache
                .call_once(|| MapCache::new(cfg.map_buf_ch_pgs, cfg.map_buf_pg_sz));
        }
        log::info!(
            "[map] {} sectors in {} map pages ({} entries per page)",
            ns_sectors,
            total_pgs,
            ent_per_pg
        );
        Ok(GlMap { ent_per_pg })
    }

    fn locate(&self, ftl: &AppFtl, lba: u64) -> (usize, usize, u64) {
        let pgi = lba / self.ent_per_pg;
        let nch = ftl.nch() as u64;
        ((pgi % nch) as usize, (pgi / nch) as usize, pgi)
    }

    /// Translate one LBA. `Ppa::UNMAPPED` means the sector was never
    /// written.
    pub fn read(&self, ftl: &AppFtl, lba: u64) -> Result<Ppa, FtlError> {
        let ent_off = (lba % self.ent_per_pg) as usize;
        let (chi, ei) = self.cache_entry(ftl, lba)?;
        let cache = ftl.channels[chi].map_cache.get().ok_or(FtlError::OutOfBounds)?;
        let ent = cache.entries[ei].lock();
        let me = MapEntry::read_at(&ent.buf, ent_off);
        if me.lba != lba {
            log::error!("[map] entry mismatch: want lba {}, found {}", lba, me.lba);
            return Err(FtlError::MapMismatch);
        }
        Ok(Ppa::from_raw(me.ppa))
    }

    /// Bind one LBA to a new PPA. Returns the previous binding. Callers
    /// guarantee at most one upserter per LBA (writes are funneled through
    /// the LBA scheduler).
    pub fn upsert(&self, ftl: &AppFtl, lba: u64, ppa: Ppa) -> Result<Ppa, FtlError> {
        let ent_off = (lba % self.ent_per_pg) as usize;
        let (chi, ei) = self.cache_entry(ftl, lba)?;
        let cache = ftl.channels[chi].map_cache.get().ok_or(FtlError::OutOfBounds)?;
        let mut ent = cache.entries[ei].lock();
        let me = MapEntry::read_at(&ent.buf, ent_off);
        if me.lba != lba {
            log::error!("[map] entry mismatch: want lba {}, found {}", lba, me.lba);
            return Err(FtlError::MapMismatch);
        }
        MapEntry {
            lba,
            ppa: ppa.raw(),
        }
        .write_at(&mut ent.buf, ent_off);
        ent.dirty = true;
        Ok(Ppa::from_raw(me.ppa))
    }

    /// Re-point a moved map page at its new media location (the GC path).
    /// Refused when the page is not where the mover last saw it.
    pub fn upsert_md(
        &self,
        ftl: &AppFtl,
        first_lba: u64,
        old_ppa: Ppa,
        new_ppa: Ppa,
    ) -> Result<(), FtlError> {
        let (chi, pg_off, _) = self.locate(ftl, first_lba);
        let ch = &ftl.channels[chi];
        let dir = ch.map_md.get().ok_or(FtlError::OutOfBounds)?;
        if pg_off >= dir.n_slots() {
            return Err(FtlError::OutOfBounds);
        }
        let mut slot = dir.slots[pg_off].lock();
        match *slot {
            DirSlot::OnDisk(cur) => {
                if cur != old_ppa {
                    return Err(FtlError::MapMismatch);
                }
                *slot = DirSlot::OnDisk(new_ppa);
            }
            DirSlot::Cached(i) => {
                let cache = ch.map_cache.get().ok_or(FtlError::OutOfBounds)?;
                let mut ent = cache.entries[i].lock();
                if ent.ppa != old_ppa {
                    return Err(FtlError::MapMismatch);
                }
                ent.ppa = new_ppa;
            }
        }
        Ok(())
    }

    /// Resolve the cache entry holding `lba`'s map page, loading it (and
    /// evicting the LRU page) as needed. Returns (channel, entry index).
    fn cache_entry(&self, ftl: &AppFtl, lba: u64) -> Result<(usize, usize), FtlError> {
        let (chi, pg_off, pgi) = self.locate(ftl, lba);
        let ch = &ftl.channels[chi];
        let dir = ch.map_md.get().ok_or(FtlError::OutOfBounds)?;
        if pg_off >= dir.n_slots() {
            log::error!("[map] page offset {} out of bounds on ch {}", pg_off, chi);
            return Err(FtlError::OutOfBounds);
        }
        let cache = ch.map_cache.get().ok_or(FtlError::OutOfBounds)?;

        let mut slot = dir.slots[pg_off].lock();
        if let DirSlot::Cached(i) = *slot {
            cache.touch(i);
            return Ok((chi, i));
        }
        let on_disk = match *slot {
            DirSlot::OnDisk(p) => p,
            DirSlot::Cached(_) => unreachable!(),
        };

        let idx = match cache.pop_free() {
            Some(i) => i,
            None => {
                self.evict_lru(ftl, chi)?;
                cache.pop_free().ok_or(FtlError::Media)?
            }
        };

        {
            let mut ent = cache.entries[idx].lock();
            ent.md_slot = Some(pg_off);
            if on_disk.is_unmapped() {
                // Page never persisted: seed fresh unmapped entries.
                let first_lba = pgi * self.ent_per_pg;
                for k in 0..self.ent_per_pg {
                    MapEntry {
                        lba: first_lba + k,
                        ppa: 0,
                    }
                    .write_at(&mut ent.buf, k as usize);
                }
                ent.dirty = true;
                ent.ppa = Ppa::UNMAPPED;
            } else if let Err(e) = self.nvm_read(ftl, &mut ent, on_disk) {
                ent.md_slot = None;
                ent.ppa = Ppa::UNMAPPED;
                drop(ent);
                cache.push_free(idx);
                log::error!("[map] page load failed on ch {}: {}", chi, e);
                return Err(e);
            } else {
                ent.dirty = false;
                ent.ppa = on_disk;
            }
        }

        *slot = DirSlot::Cached(idx);
        cache.push_used(idx);
        Ok((chi, idx))
    }

    /// Evict the channel's least-recently-used map page, flushing it first
    /// when dirty. The victim's slot mutex is distinct from any loader's
    /// (a loading page is by definition not cached), so this cannot
    /// self-deadlock.
    fn evict_lru(&self, ftl: &AppFtl, chi: usize) -> Result<(), FtlError> {
        let ch = &ftl.channels[chi];
        let cache = ch.map_cache.get().ok_or(FtlError::OutOfBounds)?;
        let dir = ch.map_md.get().ok_or(FtlError::OutOfBounds)?;

        let victim = cache.lru().ok_or(FtlError::Media)?;
        let pg_off = cache.entries[victim]
            .lock()
            .md_slot
            .ok_or(FtlError::Media)?;

        let mut slot = dir.slots[pg_off].lock();
        cache.remove_used(victim);

        let mut ent = cache.entries[victim].lock();
        if ent.dirty {
            let first_lba = dir.global_pg(pg_off) * self.ent_per_pg;
            if let Err(e) = self.nvm_write(ftl, &mut ent, first_lba) {
                drop(ent);
                cache.push_used_front(victim);
                return Err(e);
            }
            ent.dirty = false;
        }

        *slot = DirSlot::OnDisk(ent.ppa);
        ent.md_slot = None;
        ent.ppa = Ppa::UNMAPPED;
        drop(ent);
        cache.push_free(victim);
        Ok(())
    }

    /// Write a map page out through the global provisioner (one plane-page
    /// allocation) and invalidate its previous location.
    fn nvm_write(
        &self,
        ftl: &AppFtl,
        ent: &mut MapCacheEntry,
        first_lba: u64,
    ) -> Result<(), FtlError> {
        let prov = ftl.gl_prov.get_ppa_list(ftl, 1)?;
        let base = prov.ppas[0];
        let ch = &ftl.channels[base.ch() as usize];
        let geo = &ch.geo;
        if prov.nppas() != geo.sec_per_pl_pg() as usize {
            log::error!(
                "[map] wrong allocation for page flush: {} ppas",
                prov.nppas()
            );
        }

        let map_bytes = (self.ent_per_pg as usize) * MAP_ENTRY_SZ;
        let pg_sz = geo.pg_size as usize;
        let buf_sz = pg_sz + geo.pg_oob_sz() as usize;
        let oob_rec = PgOob {
            lba: first_lba,
            pg_type: PgType::Map,
        }
        .to_bytes();

        let mut cmds = Vec::with_capacity(geo.n_of_planes as usize);
        for pl in 0..geo.n_of_planes as usize {
            let mut buf = vec![0u8; buf_sz];
            let start = pl * pg_sz;
            if start < map_bytes {
                let take = pg_sz.min(map_bytes - start);
                buf[..take].copy_from_slice(&ent.buf[start..start + take]);
            }
            for sec in 0..geo.sec_per_pg as usize {
                let off = pg_sz + sec * geo.sec_oob_sz as usize;
                buf[off..off + oob_rec.len()].copy_from_slice(&oob_rec);
            }
            cmds.push(MediaIoCmd::write_page(base.with_pl(pl as u8), geo, buf));
        }

        let res = ch.sync.multi(cmds);
        match res {
            Ok(_) => {
                if !ent.ppa.is_unmapped() {
                    let old_ch = &ftl.channels[ent.ppa.ch() as usize];
                    blk_md::invalidate(old_ch, ent.ppa, Grain::Page);
                }
                ent.ppa = base;
                ftl.gl_prov.free_ppa_list(ftl, prov);
                Ok(())
            }
            Err(e) => {
                blk_md::invalidate(ch, base, Grain::Page);
                ftl.gl_prov.free_ppa_list(ftl, prov);
                log::error!("[map] page flush failed at {:?}", base);
                Err(e.into())
            }
        }
    }

    /// Read a map page back from media into a cache buffer.
    fn nvm_read(&self, ftl: &AppFtl, ent: &mut MapCacheEntry, ppa: Ppa) -> Result<(), FtlError> {
        let ch = &ftl.channels[ppa.ch() as usize];
        let geo = &ch.geo;
        let cmds = (0..geo.n_of_planes)
            .map(|pl| MediaIoCmd::read_page(ppa.with_pl(pl), geo))
            .collect();
        let mut done = ch.sync.multi(cmds)?;
        done.sort_by_key(|c| c.ppa.pl());

        let map_bytes = (self.ent_per_pg as usize) * MAP_ENTRY_SZ;
        let pg_sz = geo.pg_size as usize;
        for (pl, cmd) in done.iter().enumerate() {
            let start = pl * pg_sz;
            if start < map_bytes {
                let take = pg_sz.min(map_bytes - start);
                ent.buf[start..start + take].copy_from_slice(&cmd.data[..take]);
            }
        }
        Ok(())
    }

    /// Flush every cached dirty page; used at shutdown.
    pub fn exit_flush(&self, ftl: &AppFtl) -> Result<(), FtlError> {
        for (chi, ch) in ftl.channels.iter().enumerate() {
            let cache = match ch.map_cache.get() {
                Some(c) => c,
                None => continue,
            };
            while cache.nused() > 0 {
                self.evict_lru(ftl, chi)?;
            }
        }
        Ok(())
    }
}
