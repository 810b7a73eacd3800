/// Global provisioner.
///
/// Spreads page allocation across the active channels, round-robin from a
/// rotating cursor, taking a busy reference on every channel it touches.
/// When a channel cannot serve its share it is flagged for collection,
/// deactivated, and the remainder is redistributed among the survivors; the
/// call fails only when no channel is left. The flat result interleaves
/// plane-page chunks channel by channel so sequential writers fan out
/// maximally.
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::ftl::blk_md::{self, Grain};
use crate::ftl::{AppFtl, FtlError};
use crate::ppa::Ppa;

/// A page allocation: the flat sector PPA list plus the channels whose busy
/// reference it still holds. Release with `free_ppa_list`.
pub struct ProvPpas {
    pub ppas: Vec<Ppa>,
    pub taken: Vec<u16>,
}

impl ProvPpas {
    pub fn nppas(&self) -> usize {
        self.ppas.len()
    }
}

pub struct GlProv {
    cur_ch: Mutex<usize>,
}

impl GlProv {
    pub fn new() -> Self {
        Self {
            cur_ch: Mutex::new(0),
        }
    }

    pub fn get_ppa_list(&self, ftl: &AppFtl, npgs: usize) -> Result<ProvPpas, FtlError> {
        let nch = ftl.nch();

        // Snapshot the active channels under busy references.
        let mut holding = vec![false; nch];
        for (i, ch) in ftl.channels.iter().enumerate() {
            if ch.is_active() && ch.inc_busy() {
                holding[i] = true;
            }
        }
        if !holding.iter().any(|&h| h) {
            return Err(FtlError::NoActiveChannels);
        }

        // Collect the cursor and rotate it for the next caller.
        let cc = {
            let mut cur = self.cur_ch.lock();
            let cc = *cur;
            *cur = (cc + npgs) % nch;
            cc
        };

        let mut per_ch: Vec<Vec<Ppa>> = vec![Vec::new(); nch];
        let mut remaining = npgs;

        while remaining > 0 {
            let order: Vec<usize> = (0..nch)
                .map(|i| (cc + i) % nch)
                .filter(|&i| holding[i])
                .collect();
            if order.is_empty() {
                // Nothing left to serve the remainder: release every busy
                // reference and orphan-flag what was already handed out.
                for i in 0..nch {
                    let ch = &ftl.channels[i];
                    let spp = ch.geo.sec_per_pl_pg() as usize;
                    for pg in per_ch[i].chunks(spp) {
                        blk_md::invalidate(ch, pg[0], Grain::Page);
                    }
                    if holding[i] {
                        ch.dec_busy();
                    }
                }
                return Err(FtlError::NoActiveChannels);
            }

            let base = remaining / order.len();
            let extra = remaining % order.len();
            let mut failed = None;

            for (i, &chi) in order.iter().enumerate() {
                let want = base + usize::from(i < extra);
                if want == 0 {
                    continue;
                }
                let ch = &ftl.channels[chi];
                let mut list = Vec::new();
                match ch.prov.get_ppas(ch, want, &mut list) {
                    Ok(()) => {
                        remaining -= want;
                        per_ch[chi].extend(list);
                    }
                    Err(_) => {
                        // Pages the channel did hand out before failing are
                        // orphaned; flag them invalid so GC reclaims them.
                        let spp = ch.geo.sec_per_pl_pg() as usize;
                        for pg in list.chunks(spp) {
                            blk_md::invalidate(ch, pg[0], Grain::Page);
                        }
                        log::info!(
                            "[prov] ch {}: allocation failed, flagged for GC",
                            ch.id
                        );
                        ch.dec_busy();
                        ch.need_gc_set();
                        ch.active_unset();
                        holding[chi] = false;
                        failed = Some(chi);
                        break;
                    }
                }
            }

            if failed.is_none() {
                break;
            }
            // Redistribute what is left among the surviving channels.
        }

        // Interleave plane-page chunks in cursor order for parallelism.
        let mut offs = vec![0usize; nch];
        let total: usize = per_ch.iter().map(|v| v.len()).sum();
        let mut flat = Vec::with_capacity(total);
        while flat.len() < total {
            for i in 0..nch {
                let chi = (cc + i) % nch;
                let spp = ftl.channels[chi].geo.sec_per_pl_pg() as usize;
                if offs[chi] < per_ch[chi].len() {
                    flat.extend_from_slice(&per_ch[chi][offs[chi]..offs[chi] + spp]);
                    offs[chi] += spp;
                }
            }
        }

        // Keep busy references only on channels that contributed pages.
        let mut taken = Vec::new();
        for i in 0..nch {
            if !holding[i] {
                continue;
            }
            if per_ch[i].is_empty() {
                ftl.channels[i].dec_busy();
            } else {
                taken.push(i as u16);
            }
        }

        Ok(ProvPpas { ppas: flat, taken })
    }

    /// Drop the busy references a prior allocation still holds.
    pub fn free_ppa_list(&self, ftl: &AppFtl, ppas: ProvPpas) {
        for &chi in &ppas.taken {
            ftl.channels[chi as usize].dec_busy();
        }
    }
}
