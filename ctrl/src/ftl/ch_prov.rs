/// Channel provisioner.
///
/// Per LUN, three lists over the block-metadata entries: free, used and
/// open. Blocks are acquired erase-first (an erase failure marks the block
/// bad and the next candidate is tried), write pointers advance strictly
/// sequentially inside a block, and full blocks are closed. Fresh blocks are
/// shuffled into the free lists at build time so wear starts randomized.
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use rand_core::RngCore;
use spin::Mutex;

use crate::ftl::blk_md::BlkFlags;
use crate::ftl::{bbt, FtlChannel, FtlError};
use crate::geo::Geometry;
use crate::mmgr::MediaIoCmd;
use crate::ppa::Ppa;

struct LunProv {
    free: VecDeque<u16>,
    used: Vec<u16>,
    open: Vec<u16>,
}

pub struct ChProv {
    luns: Vec<Mutex<LunProv>>,
    cur_lun: AtomicUsize,
}

impl ChProv {
    pub fn new(geo: &Geometry) -> Self {
        let mut luns = Vec::with_capacity(geo.lun_per_ch as usize);
        for _ in 0..geo.lun_per_ch {
            luns.push(Mutex::new(LunProv {
                free: VecDeque::new(),
                used: Vec::new(),
                open: Vec::new(),
            }));
        }
        Self {
            luns,
            cur_lun: AtomicUsize::new(0),
        }
    }

    /// Build the lists from the bad-block table and block metadata.
    pub fn build(&self, ch: &FtlChannel, rng: &mut dyn RngCore) {
        let bbt = ch.bbt.lock();
        let md = ch.blk_md.lock();
        for lun in 0..ch.geo.lun_per_ch {
            let mut lists = self.luns[lun as usize].lock();
            lists.free.clear();
            lists.used.clear();
            lists.open.clear();
            for blk in 0..ch.geo.blk_per_lun {
                if bbt.is_bad(lun, blk) {
                    continue;
                }
                let ent = md.get(lun, blk);
                if ent.flags.contains(BlkFlags::USED) {
                    lists.used.push(blk);
                    if ent.flags.contains(BlkFlags::OPEN) {
                        lists.open.push(blk);
                    }
                } else {
                    let at = (rng.next_u64() % (lists.free.len() as u64 + 1)) as usize;
                    lists.free.insert(at, blk);
                }
            }
        }
    }

    pub fn nfree(&self) -> usize {
        self.luns.iter().map(|l| l.lock().free.len()).sum()
    }

    pub fn nused(&self) -> usize {
        self.luns.iter().map(|l| l.lock().used.len()).sum()
    }

    /// Acquire a block from a LUN's free list, erased and reset, opened for
    /// writes. Erase failures mark the block bad and the next is tried.
    pub fn get_block(&self, ch: &FtlChannel, lun: u8) -> Option<u16> {
        loop {
            let blk = {
                let mut lists = self.luns[lun as usize].lock();
                let blk = lists.free.pop_front()?;
                lists.used.push(blk);
                lists.open.push(blk);
                blk
            };

            let cmds: Vec<_> = (0..ch.geo.n_of_planes)
                .map(|pl| MediaIoCmd::erase_blk(Ppa::new(ch.mmgr_id, lun, pl, blk, 0, 0)))
                .collect();
            if ch.sync.multi(cmds).is_err() {
                log::warn!(
                    "[prov] ch {}: erase failed, marking lun {} blk {} bad",
                    ch.id,
                    lun,
                    blk
                );
                ch.bbt.lock().mark_blk(lun, blk, bbt::BBT_BAD);
                if bbt::flush(ch).is_err() {
                    log::warn!("[prov] ch {}: bad block table flush failed", ch.id);
                }
                let mut lists = self.luns[lun as usize].lock();
                lists.used.retain(|&b| b != blk);
                lists.open.retain(|&b| b != blk);
                continue;
            }

            let mut md = ch.blk_md.lock();
            let ent = md.get_mut(lun, blk);
            ent.reset();
            ent.erase_count += 1;
            return Some(blk);
        }
    }

    /// Return a fully-recycled block to the free list. The block must be
    /// used and closed.
    pub fn put_block(&self, ch: &FtlChannel, lun: u8, blk: u16) -> Result<(), FtlError> {
        {
            let mut md = ch.blk_md.lock();
            let ent = md.get_mut(lun, blk);
            if !ent.flags.contains(BlkFlags::USED) || ent.flags.contains(BlkFlags::OPEN) {
                return Err(FtlError::BlockState);
            }
            ent.flags.remove(BlkFlags::USED);
        }
        let mut lists = self.luns[lun as usize].lock();
        lists.used.retain(|&b| b != blk);
        lists.free.push_back(blk);
        Ok(())
    }

    /// Allocate `npgs` multi-plane pages, round-robin across LUNs, opening
    /// blocks on demand. Appends `npgs * sec_per_pl_pg` sector PPAs.
    pub fn get_ppas(&self, ch: &FtlChannel, npgs: usize, out: &mut Vec<Ppa>) -> Result<(), FtlError> {
        let n_luns = self.luns.len();
        for _ in 0..npgs {
            let mut placed = false;
            for _ in 0..n_luns {
                let lun = (self.cur_lun.fetch_add(1, Ordering::Relaxed) % n_luns) as u8;
                if let Some((blk, pg)) = self.alloc_page(ch, lun) {
                    for pl in 0..ch.geo.n_of_planes {
                        for sec in 0..ch.geo.sec_per_pg as u8 {
                            out.push(Ppa::new(ch.mmgr_id, lun, pl, blk, pg, sec));
                        }
                    }
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(FtlError::NoFreeBlocks);
            }
        }
        Ok(())
    }

    /// Take the next page of the LUN's open block, opening a new block when
    /// none is open. Advances the write pointer; closes the block when the
    /// pointer reaches the end.
    fn alloc_page(&self, ch: &FtlChannel, lun: u8) -> Option<(u16, u16)> {
        loop {
            let open_blk = self.luns[lun as usize].lock().open.last().copied();
            let blk = match open_blk {
                Some(b) => b,
                None => {
                    self.get_block(ch, lun)?;
                    continue;
                }
            };

            let (pg, closed) = {
                let mut md = ch.blk_md.lock();
                let ent = md.get_mut(lun, blk);
                if !ent.flags.contains(BlkFlags::OPEN) {
                    // Closed behind our back; drop it from the open list.
                    drop(md);
                    self.luns[lun as usize].lock().open.retain(|&b| b != blk);
                    continue;
                }
                let pg = ent.current_pg;
                ent.current_pg += 1;
                let closed = ent.current_pg == ch.geo.pg_per_blk;
                if closed {
                    ent.flags.remove(BlkFlags::OPEN);
                }
                (pg, closed)
            };
            if closed {
                self.luns[lun as usize].lock().open.retain(|&b| b != blk);
            }
            return Some((blk, pg));
        }
    }

    /// Close an open block after a failed write so no further writes land
    /// behind the break; the sequential-write invariant inside a block is
    /// load-bearing for reads.
    pub fn retire(&self, ch: &FtlChannel, ppa: Ppa) {
        let lun = ppa.lun();
        let blk = ppa.blk();
        let was_open = {
            let mut md = ch.blk_md.lock();
            let ent = md.get_mut(lun, blk);
            let open = ent.flags.contains(BlkFlags::OPEN);
            if open {
                ent.flags.remove(BlkFlags::OPEN);
                ent.current_pg = ch.geo.pg_per_blk;
            }
            open
        };
        if was_open {
            log::warn!("[prov] ch {}: retired lun {} blk {}", ch.id, lun, blk);
            self.luns[lun as usize].lock().open.retain(|&b| b != blk);
        }
    }
}
