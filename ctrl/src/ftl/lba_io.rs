/// LBA I/O scheduler.
///
/// Host sectors are queued per direction (write queue 0, read queue 1),
/// pulled into an accumulation line and flushed as plane-aligned PPA I/Os:
/// writes get fresh PPAs from the global provisioner (short tails padded
/// with a repeat of the first sector), reads resolve PPAs through the map.
/// The map is only upserted once a whole host write has succeeded, with
/// rollback if any upsert fails; old bindings are invalidated afterwards.
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::FtlConfig;
use crate::ftl::blk_md::{self, Grain};
use crate::ftl::gl_prov::ProvPpas;
use crate::ftl::{AppFtl, CmdId, FtlChannel, FtlError, HostStatus, Pool, SecSaved};
use crate::mq::{MqConfig, MqFlags, MqTicket, MultiQueue};
use crate::ppa::Ppa;

pub const WRITE_Q: usize = 0;
pub const READ_Q: usize = 1;

/// Hard cap on sectors per PPA I/O.
pub const LBA_IO_PPA_SIZE: usize = 64;

/// One host sector in flight.
pub struct LbaSec {
    pub lba: u64,
    pub cmd: CmdId,
    /// Sector index within the host command.
    pub lba_id: u32,
    pub ppa: Ppa,
    pub qtype: usize,
    pub ticket: Option<MqTicket>,
}

/// One PPA I/O under construction or in flight.
pub struct LbaCmd {
    pub write: bool,
    pub ppas: Vec<Ppa>,
    /// Sector feeding each PPA slot; `None` marks a padding slot.
    pub secs: Vec<Option<usize>>,
    pub prov: Option<ProvPpas>,
    pub pending: u16,
    pub total: u16,
    pub failed: bool,
    /// (start, len) runs of `ppas` per media command.
    pub groups: Vec<(usize, u16)>,
    /// Phys-path host command served without mapping.
    pub direct: Option<CmdId>,
}

struct Line {
    secs: Vec<usize>,
    /// When the first sector of the current line arrived.
    since_us: u64,
}

pub struct LbaIo {
    pub mq: MultiQueue<usize>,
    pub secs: Mutex<Pool<LbaSec>>,
    pub cmds: Mutex<Pool<LbaCmd>>,
    lines: [Mutex<Line>; 2],
    sec_pl_pg: usize,
    line_cap: usize,
    empty_us: u64,
    retry: usize,
}

impl LbaIo {
    pub fn new(cfg: &FtlConfig, channels: &[Arc<FtlChannel>]) -> Result<Self, FtlError> {
        let mut spp = usize::MAX;
        for ch in channels {
            spp = spp.min(ch.geo.sec_per_pl_pg() as usize);
        }
        if spp == 0 || spp == usize::MAX {
            return Err(FtlError::OutOfBounds);
        }
        let mq = MultiQueue::new(MqConfig {
            name: "lba-io",
            n_queues: 2,
            q_size: cfg.lba_io_entries * 128,
            to_usec: cfg.lba_queue_to_us,
            flags: MqFlags::empty(),
        })
        .map_err(|_| FtlError::QueueFull)?;
        Ok(Self {
            mq,
            secs: Mutex::new(Pool::new(cfg.lba_io_entries * LBA_IO_PPA_SIZE)),
            cmds: Mutex::new(Pool::new(cfg.lba_io_entries)),
            lines: [
                Mutex::new(Line {
                    secs: Vec::new(),
                    since_us: 0,
                }),
                Mutex::new(Line {
                    secs: Vec::new(),
                    since_us: 0,
                }),
            ],
            sec_pl_pg: spp,
            line_cap: (LBA_IO_PPA_SIZE / spp).max(1) * spp,
            empty_us: cfg.lba_io_empty_us,
            retry: cfg.queue_retry,
        })
    }

    pub fn sec_pl_pg(&self) -> usize {
        self.sec_pl_pg
    }

    /// Bind a host command's sectors and queue them, one entry per sector.
    pub fn submit(&self, ftl: &AppFtl, host_id: CmdId, now_us: u64) -> Result<(), FtlError> {
        let (slba, n_sec, qtype) = {
            let hosts = ftl.hosts.lock();
            let host = hosts.get(host_id).ok_or(FtlError::OutOfBounds)?;
            let q = if host.kind.is_write() { WRITE_Q } else { READ_Q };
            (host.slba, host.n_sec, q)
        };

        let mut taken: Vec<usize> = Vec::with_capacity(n_sec as usize);
        {
            let mut secs = self.secs.lock();
            for i in 0..n_sec {
                match secs.alloc(LbaSec {
                    lba: slba + i as u64,
                    cmd: host_id,
                    lba_id: i,
                    ppa: Ppa::UNMAPPED,
                    qtype,
                    ticket: None,
                }) {
                    Some(id) => taken.push(id),
                    None => {
                        for id in taken {
                            secs.release(id);
                        }
                        return Err(FtlError::PoolExhausted);
                    }
                }
            }
        }

        for (i, &sec_id) in taken.iter().enumerate() {
            if self.mq.submit(qtype, sec_id, now_us).is_err() {
                // Sectors already queued will flow through; account the rest
                // as failed so the command still completes exactly once.
                let unqueued = &taken[i..];
                {
                    let mut secs = self.secs.lock();
                    for &id in unqueued {
                        secs.release(id);
                    }
                }
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(host_id) {
                    host.fail(HostStatus::CapExceeded);
                    host.pgs_p += unqueued.len() as u32;
                }
                if i == 0 {
                    return Err(FtlError::QueueFull);
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Pump one direction: drain queued sectors into the line, flush full
    /// lines immediately and a partial line once it has idled long enough.
    pub fn pump(&self, ftl: &AppFtl, qtype: usize, now_us: u64) {
        let mut batch: Vec<(usize, MqTicket)> = Vec::new();
        self.mq
            .process_sq(qtype, usize::MAX, &mut |sec_id, ticket| {
                batch.push((sec_id, ticket));
            });

        for (sec_id, ticket) in batch {
            {
                let mut secs = self.secs.lock();
                if let Some(sec) = secs.get_mut(sec_id) {
                    sec.ticket = Some(ticket);
                }
            }
            let full = {
                let mut line = self.lines[qtype].lock();
                if line.secs.is_empty() {
                    line.since_us = now_us;
                }
                line.secs.push(sec_id);
                line.secs.len() >= self.line_cap
            };
            if full {
                self.flush_line(ftl, qtype);
            }
        }

        let flush_partial = {
            let line = self.lines[qtype].lock();
            !line.secs.is_empty()
                && self.mq.used_count(qtype) == 0
                && now_us.saturating_sub(line.since_us) >= self.empty_us
        };
        if flush_partial {
            self.flush_line(ftl, qtype);
        }

        let mut done: Vec<usize> = Vec::new();
        self.mq
            .process_cq(qtype, usize::MAX, &mut |sec_id| done.push(sec_id));
        for sec_id in done {
            self.sec_callback(ftl, sec_id);
        }
    }

    /// Sweep the sector queues; a timed-out sector fails its host command
    /// with a media timeout and returns to the pool.
    pub fn sweep(&self, ftl: &AppFtl, now_us: u64) {
        let mut stale: Vec<usize> = Vec::new();
        self.mq.sweep(now_us, &mut |batch| {
            stale.extend_from_slice(batch);
        });
        for sec_id in stale {
            let host_id = {
                let secs = self.secs.lock();
                match secs.get(sec_id) {
                    Some(s) => {
                        log::warn!("[lba] timeout lba {} (host {})", s.lba, s.cmd);
                        s.cmd
                    }
                    None => continue,
                }
            };
            {
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(host_id) {
                    host.fail(HostStatus::MediaTimeout);
                    host.pgs_p += 1;
                }
            }
            self.host_maybe_done(ftl, host_id);
            self.secs.lock().release(sec_id);
        }
    }

    fn take_line(&self, qtype: usize) -> Vec<usize> {
        let mut line = self.lines[qtype].lock();
        core::mem::take(&mut line.secs)
    }

    fn flush_line(&self, ftl: &AppFtl, qtype: usize) {
        let secs = self.take_line(qtype);
        if secs.is_empty() {
            return;
        }
        let res = if qtype == WRITE_Q {
            self.flush_write(ftl, &secs)
        } else {
            self.flush_read(ftl, &secs)
        };
        if let Err(e) = res {
            log::warn!("[lba] line flush failed: {}", e);
            let status = match e {
                FtlError::NoActiveChannels | FtlError::NoFreeBlocks => HostStatus::CapExceeded,
                _ => HostStatus::DataTrasError,
            };
            self.fail_secs(ftl, &secs, status);
        }
    }

    fn flush_write(&self, ftl: &AppFtl, line: &[usize]) -> Result<(), FtlError> {
        let nlb = line.len();
        let npgs = (nlb + self.sec_pl_pg - 1) / self.sec_pl_pg;

        let prov = ftl.gl_prov.get_ppa_list(ftl, npgs)?;
        if prov.nppas() < nlb {
            ftl.gl_prov.free_ppa_list(ftl, prov);
            return Err(FtlError::NoFreeBlocks);
        }

        let ppas = prov.ppas.clone();
        let mut slot_secs: Vec<Option<usize>> = Vec::with_capacity(ppas.len());

        for (i, &sec_id) in line.iter().enumerate() {
            let (lba, host_id) = {
                let mut secs = self.secs.lock();
                let sec = secs.get_mut(sec_id).ok_or(FtlError::OutOfBounds)?;
                sec.ppa = ppas[i];
                (sec.lba, sec.cmd)
            };
            // Journal the pair so the map is only touched on full success.
            let mut hosts = ftl.hosts.lock();
            if let Some(host) = hosts.get_mut(host_id) {
                host.saved.push(SecSaved {
                    lba,
                    new_ppa: ppas[i],
                    old_ppa: Ppa::UNMAPPED,
                });
            }
            slot_secs.push(Some(sec_id));
        }
        for _ in nlb..ppas.len() {
            slot_secs.push(None);
        }

        let lcmd = LbaCmd {
            write: true,
            ppas,
            secs: slot_secs,
            prov: Some(prov),
            pending: 0,
            total: 0,
            failed: false,
            groups: Vec::new(),
            direct: None,
        };
        let lcmd_id = self
            .cmds
            .lock()
            .alloc(lcmd)
            .ok_or(FtlError::PoolExhausted)?;

        if let Err(e) = ftl.page_io.submit_lcmd(ftl, lcmd_id) {
            if let Some(lcmd) = self.cmds.lock().release(lcmd_id) {
                if let Some(prov) = lcmd.prov {
                    ftl.gl_prov.free_ppa_list(ftl, prov);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn flush_read(&self, ftl: &AppFtl, line: &[usize]) -> Result<(), FtlError> {
        let mut ppas = Vec::with_capacity(line.len());
        let mut slot_secs = Vec::with_capacity(line.len());

        for &sec_id in line {
            let lba = {
                let secs = self.secs.lock();
                secs.get(sec_id).ok_or(FtlError::OutOfBounds)?.lba
            };
            let ppa = ftl.gl_map.read(ftl, lba)?;
            {
                let mut secs = self.secs.lock();
                if let Some(sec) = secs.get_mut(sec_id) {
                    sec.ppa = ppa;
                }
            }
            ppas.push(ppa);
            slot_secs.push(Some(sec_id));
        }

        let lcmd = LbaCmd {
            write: false,
            ppas,
            secs: slot_secs,
            prov: None,
            pending: 0,
            total: 0,
            failed: false,
            groups: Vec::new(),
            direct: None,
        };
        let lcmd_id = self
            .cmds
            .lock()
            .alloc(lcmd)
            .ok_or(FtlError::PoolExhausted)?;
        ftl.page_io.submit_lcmd(ftl, lcmd_id)
    }

    /// Fail every sector of an unflushable line and push them through the
    /// completion path so host accounting stays exact.
    fn fail_secs(&self, ftl: &AppFtl, secs: &[usize], status: HostStatus) {
        for &sec_id in secs {
            let (host_id, ticket) = {
                let pool = self.secs.lock();
                match pool.get(sec_id) {
                    Some(s) => (s.cmd, s.ticket),
                    None => continue,
                }
            };
            {
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(host_id) {
                    host.fail(status);
                }
            }
            if let Some(t) = ticket {
                self.complete_ticket(t);
            }
        }
    }

    fn complete_ticket(&self, ticket: MqTicket) {
        for _ in 0..self.retry {
            if self.mq.complete(ticket).is_ok() {
                return;
            }
        }
        log::error!("[lba] completion queue jammed, sector dropped");
    }

    /// All media pages of a PPA I/O have landed.
    pub(crate) fn lcmd_done(&self, ftl: &AppFtl, lcmd_id: usize) {
        let lcmd = match self.cmds.lock().release(lcmd_id) {
            Some(c) => c,
            None => return,
        };

        if lcmd.write && lcmd.failed {
            // A broken write retires the block: nothing may land behind the
            // break, and the sectors staged here are unreachable.
            let mut seen: Vec<u64> = Vec::new();
            for &ppa in &lcmd.ppas {
                let key = ppa.blk_base().raw();
                let ch = &ftl.channels[ppa.ch() as usize];
                if !seen.contains(&key) {
                    seen.push(key);
                    ch.prov.retire(ch, ppa);
                }
                blk_md::invalidate(ch, ppa, Grain::Sector);
            }
        } else if lcmd.write {
            for (i, slot) in lcmd.secs.iter().enumerate() {
                if slot.is_none() {
                    let ppa = lcmd.ppas[i];
                    let ch = &ftl.channels[ppa.ch() as usize];
                    blk_md::invalidate(ch, ppa, Grain::Sector);
                }
            }
        }

        if let Some(prov) = lcmd.prov {
            ftl.gl_prov.free_ppa_list(ftl, prov);
        }

        for slot in lcmd.secs.iter().copied().flatten() {
            let (host_id, ticket) = {
                let pool = self.secs.lock();
                match pool.get(slot) {
                    Some(s) => (s.cmd, s.ticket),
                    None => continue,
                }
            };
            if lcmd.failed {
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(host_id) {
                    host.fail(HostStatus::DataTrasError);
                }
            }
            if let Some(t) = ticket {
                self.complete_ticket(t);
            }
        }
    }

    /// Sector completion (CQ side): account it against its host command and
    /// finish the command when every sector has reported.
    fn sec_callback(&self, ftl: &AppFtl, sec_id: usize) {
        let host_id = {
            let secs = self.secs.lock();
            match secs.get(sec_id) {
                Some(s) => s.cmd,
                None => return,
            }
        };
        {
            let mut hosts = ftl.hosts.lock();
            if let Some(host) = hosts.get_mut(host_id) {
                host.pgs_p += 1;
            }
        }
        self.host_maybe_done(ftl, host_id);
        self.secs.lock().release(sec_id);
    }

    fn host_maybe_done(&self, ftl: &AppFtl, host_id: CmdId) {
        let (complete, write, failed) = {
            let hosts = ftl.hosts.lock();
            match hosts.get(host_id) {
                Some(h) => (h.pgs_p >= h.n_sec, h.kind.is_write(), h.failed),
                None => return,
            }
        };
        if !complete {
            return;
        }

        if write && !failed {
            self.upsert_host(ftl, host_id);
        }

        let already = {
            let mut hosts = ftl.hosts.lock();
            match hosts.get_mut(host_id) {
                Some(h) => {
                    let was = h.done;
                    h.done = true;
                    was
                }
                None => return,
            }
        };
        if !already {
            ftl.finish_host(host_id);
        }
    }

    /// Deferred map update for a completed host write: bind every journaled
    /// sector, serialized against GC, rolling everything back if any bind
    /// fails. Superseded bindings are invalidated only after full success.
    fn upsert_host(&self, ftl: &AppFtl, host_id: CmdId) {
        let mut saved = {
            let hosts = ftl.hosts.lock();
            match hosts.get(host_id) {
                Some(h) => h.saved.clone(),
                None => return,
            }
        };

        let mut fail_at = None;
        for i in 0..saved.len() {
            let _ns = ftl.ns_mutex.lock();
            match ftl.gl_map.upsert(ftl, saved[i].lba, saved[i].new_ppa) {
                Ok(old) => saved[i].old_ppa = old,
                Err(_) => {
                    fail_at = Some(i);
                    break;
                }
            }
        }

        match fail_at {
            None => {
                for s in &saved {
                    if !s.old_ppa.is_unmapped() {
                        let ch = &ftl.channels[s.old_ppa.ch() as usize];
                        blk_md::invalidate(ch, s.old_ppa, Grain::Sector);
                    }
                }
            }
            Some(n) => {
                log::error!("[lba] map upsert failed, rolling back {} sectors", n);
                for s in saved[..n].iter().rev() {
                    let _ns = ftl.ns_mutex.lock();
                    if ftl.gl_map.upsert(ftl, s.lba, s.old_ppa).is_err() {
                        log::error!("[lba] rollback failed for lba {}", s.lba);
                    }
                }
                for s in &saved {
                    let ch = &ftl.channels[s.new_ppa.ch() as usize];
                    blk_md::invalidate(ch, s.new_ppa, Grain::Sector);
                }
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(host_id) {
                    host.fail(HostStatus::InternalDevError);
                }
            }
        }
    }
}
