/// Controller core.
///
/// Brings the stack up in order (media manager, FTL channels, channel table
/// and namespace sizing, FTL globals), owns the host-facing multi-queue and
/// routes NVMe-style read/write commands into the FTL. `poll` advances the
/// whole pipeline one step; completions are drained with `pop_completion`.
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::FtlConfig;
use crate::ftl::{
    AppFtl, CmdId, FtlCap, FtlChannel, FtlError, HostCmd, HostKind, HostStatus, FTL_ID_APP,
};
use crate::mmgr::{ChannelInfo, MediaManager, CH_IN_USE};
use crate::mq::{MqConfig, MqFlags, MultiQueue};
use crate::ppa::Ppa;
use crate::sync::SyncIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlError {
    Ftl(FtlError),
    Config,
}

impl fmt::Display for CtrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtrlError::Ftl(e) => write!(f, "ftl: {}", e),
            CtrlError::Config => write!(f, "invalid controller configuration"),
        }
    }
}

impl From<FtlError> for CtrlError {
    fn from(e: FtlError) -> Self {
        CtrlError::Ftl(e)
    }
}

/// Finished host command, as the front-end sees it.
pub struct HostCompletion {
    pub cid: u64,
    pub status: HostStatus,
    /// Sector buffers for reads.
    pub data: Option<Vec<Vec<u8>>>,
}

/// Capability-gated FTL requests (the admin-side surface).
pub enum CapReq<'a> {
    GetBbtbl {
        ppa: Ppa,
        nblk: usize,
        out: &'a mut Vec<u8>,
    },
    SetBbtbl {
        ppa: Ppa,
        value: u8,
    },
}

pub struct Controller {
    pub ftl: AppFtl,
    ftl_mq: MultiQueue<CmdId>,
    next_cid: AtomicU64,
    next_q: [AtomicUsize; 2],
    ns_sectors: u64,
    sec_sz: u32,
    done: Mutex<VecDeque<HostCompletion>>,
}

impl Controller {
    /// Full bring-up: channel table, namespace sizing, FTL globals.
    pub fn new(mm: Arc<dyn MediaManager>, cfg: FtlConfig) -> Result<Controller, CtrlError> {
        let geo = *mm.geometry();
        geo.log_layout();
        if cfg.nq < 2 || cfg.nq % 2 != 0 {
            return Err(CtrlError::Config);
        }

        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        let sync = Arc::new(SyncIo::new(mm.clone(), inbox, cfg.sync_io_polls));

        let mut channels = Vec::with_capacity(geo.n_of_ch as usize);
        let mut ns_sectors = 0u64;
        for i in 0..geo.n_of_ch as u16 {
            let mut info = mm.channel_info(i);
            if !info.is_in_use() {
                info = ChannelInfo {
                    ns_id: 1,
                    ns_part: i as u32,
                    ftl_id: FTL_ID_APP,
                    in_use: CH_IN_USE,
                };
                mm.set_channel_info(i, info);
            }

            let mut ch = FtlChannel::init(i, i, mm.as_ref(), sync.clone(), cfg.prov_seed)?;
            ch.slba = ns_sectors;
            ch.elba = ns_sectors + ch.ns_sectors - 1;
            ns_sectors += ch.ns_sectors;
            channels.push(Arc::new(ch));
        }

        let ftl_mq = MultiQueue::new(MqConfig {
            name: "ftl",
            n_queues: cfg.nq,
            q_size: cfg.queue_size,
            to_usec: cfg.ftl_queue_to_us,
            flags: MqFlags::TO_COMPLETE,
        })
        .map_err(|_| CtrlError::Config)?;

        let ftl = AppFtl::new(cfg, mm, sync, channels)?;
        log::info!(
            "[ctrl] namespace: {} sectors ({} MiB)",
            ns_sectors,
            ns_sectors * geo.sec_size() as u64 / (1024 * 1024)
        );

        Ok(Controller {
            ftl,
            ftl_mq,
            next_cid: AtomicU64::new(1),
            next_q: [AtomicUsize::new(0), AtomicUsize::new(0)],
            ns_sectors,
            sec_sz: geo.sec_size(),
            done: Mutex::new(VecDeque::new()),
        })
    }

    pub fn ns_sectors(&self) -> u64 {
        self.ns_sectors
    }

    pub fn sec_size(&self) -> u32 {
        self.sec_sz
    }

    /// Host commands still owned by the FTL.
    pub fn pending(&self) -> usize {
        self.ftl.hosts.lock().in_use()
    }

    /// Writes go to the lower queue half, reads to the upper, round-robin
    /// within each class.
    fn q_schedule(&self, write: bool) -> usize {
        let half = self.ftl.cfg.nq / 2;
        let class = usize::from(!write);
        let idx = self.next_q[class].fetch_add(1, Ordering::Relaxed) % half;
        class * half + idx
    }

    fn q_schedule_phys(&self, ppas: &[Ppa]) -> usize {
        let nq = self.ftl.cfg.nq;
        let multi_ch = ppas.iter().any(|p| p.ch() != ppas[0].ch());
        if multi_ch {
            self.next_q[0].fetch_add(1, Ordering::Relaxed) % nq
        } else {
            ppas[0].ch() as usize % nq
        }
    }

    fn enqueue(&self, cmd: HostCmd, qid: usize, now_us: u64) -> Result<u64, HostStatus> {
        let cid = cmd.cid;
        let id = self
            .ftl
            .hosts
            .lock()
            .alloc(cmd)
            .ok_or(HostStatus::CmdAbortReq)?;

        for retry in 0..self.ftl.cfg.queue_retry {
            match self.ftl_mq.submit(qid, id, now_us) {
                Ok(()) => return Ok(cid),
                Err(_) if retry + 1 < self.ftl.cfg.queue_retry => {
                    // Make forward progress so a slot can free up.
                    self.poll(now_us);
                }
                Err(_) => break,
            }
        }
        self.ftl.hosts.lock().release(id);
        Err(HostStatus::CmdAbortReq)
    }

    /// Submit a host write of whole sectors starting at `slba`.
    pub fn submit_write(&self, slba: u64, data: &[u8], now_us: u64) -> Result<u64, HostStatus> {
        let sec_sz = self.sec_sz as usize;
        if data.is_empty() || data.len() % sec_sz != 0 {
            return Err(HostStatus::InvalidField);
        }
        let n_sec = (data.len() / sec_sz) as u32;
        self.validate_range(slba, n_sec)?;

        let bufs: Vec<Vec<u8>> = data.chunks(sec_sz).map(|c| c.to_vec()).collect();
        let cmd = HostCmd::new(
            self.next_cid.fetch_add(1, Ordering::Relaxed),
            HostKind::Write,
            slba,
            n_sec,
            bufs,
        );
        self.enqueue(cmd, self.q_schedule(true), now_us)
    }

    /// Submit a host read of `n_sec` sectors starting at `slba`.
    pub fn submit_read(&self, slba: u64, n_sec: u32, now_us: u64) -> Result<u64, HostStatus> {
        self.validate_range(slba, n_sec)?;
        let bufs: Vec<Vec<u8>> = (0..n_sec)
            .map(|_| alloc::vec![0u8; self.sec_sz as usize])
            .collect();
        let cmd = HostCmd::new(
            self.next_cid.fetch_add(1, Ordering::Relaxed),
            HostKind::Read,
            slba,
            n_sec,
            bufs,
        );
        self.enqueue(cmd, self.q_schedule(false), now_us)
    }

    fn validate_range(&self, slba: u64, n_sec: u32) -> Result<(), HostStatus> {
        if n_sec == 0 || n_sec as usize > crate::ftl::lba_io::LBA_IO_PPA_SIZE {
            return Err(HostStatus::InvalidField);
        }
        if slba >= self.ns_sectors || slba + n_sec as u64 > self.ns_sectors {
            log::info!("[ctrl] I/O out of bounds: slba {} + {}", slba, n_sec);
            return Err(HostStatus::LbaRange);
        }
        Ok(())
    }

    /// Host-supplied PPA list (open-channel style): every address must name
    /// a channel managed by this FTL; the mapping layer is bypassed.
    pub fn submit_phys(
        &self,
        ppas: Vec<Ppa>,
        data: Option<&[u8]>,
        now_us: u64,
    ) -> Result<u64, HostStatus> {
        if ppas.is_empty() || ppas.len() > crate::ftl::lba_io::LBA_IO_PPA_SIZE {
            return Err(HostStatus::InvalidField);
        }
        for ppa in &ppas {
            if ppa.ch() as usize >= self.ftl.nch() {
                log::info!("[ctrl] phys I/O: channel {} not found", ppa.ch());
                return Err(HostStatus::CmdAbortReq);
            }
        }
        let n_sec = ppas.len() as u32;
        let sec_sz = self.sec_sz as usize;

        let (kind, bufs) = match data {
            Some(d) => {
                if d.len() != n_sec as usize * sec_sz {
                    return Err(HostStatus::InvalidField);
                }
                (
                    HostKind::PhysWrite,
                    d.chunks(sec_sz).map(|c| c.to_vec()).collect(),
                )
            }
            None => (
                HostKind::PhysRead,
                (0..n_sec).map(|_| alloc::vec![0u8; sec_sz]).collect(),
            ),
        };

        let qid = self.q_schedule_phys(&ppas);
        let mut cmd = HostCmd::new(
            self.next_cid.fetch_add(1, Ordering::Relaxed),
            kind,
            0,
            n_sec,
            bufs,
        );
        cmd.ppas = ppas;
        self.enqueue(cmd, qid, now_us)
    }

    /// Advance the pipeline one step: consume queued host commands, pump the
    /// LBA scheduler, drain media completions, deliver finished commands,
    /// sweep timeouts and give GC a chance to run.
    pub fn poll(&self, now_us: u64) {
        // Host submissions into the FTL.
        for qid in 0..self.ftl.cfg.nq {
            let mut batch = Vec::new();
            self.ftl_mq
                .process_sq(qid, usize::MAX, &mut |id, ticket| batch.push((id, ticket)));
            for (id, ticket) in batch {
                {
                    let mut hosts = self.ftl.hosts.lock();
                    if let Some(host) = hosts.get_mut(id) {
                        host.ticket = Some(ticket);
                    }
                }
                let mut res = Ok(());
                for retry in 0..self.ftl.cfg.queue_retry {
                    res = self.ftl.submit_io(id, now_us);
                    match res {
                        Ok(()) => break,
                        Err(_) if retry + 1 < self.ftl.cfg.queue_retry => {
                            // Drain in-flight work so pool slots free up.
                            self.ftl
                                .lba_io
                                .pump(&self.ftl, crate::ftl::lba_io::WRITE_Q, now_us);
                            self.ftl
                                .lba_io
                                .pump(&self.ftl, crate::ftl::lba_io::READ_Q, now_us);
                            self.ftl.process_media();
                        }
                        Err(_) => {}
                    }
                }
                if let Err(e) = res {
                    log::warn!("[ctrl] FTL rejected command {}: {}", id, e);
                    let mut hosts = self.ftl.hosts.lock();
                    if let Some(host) = hosts.get_mut(id) {
                        if host.status == HostStatus::Success {
                            host.fail(HostStatus::CmdAbortReq);
                        }
                        host.done = true;
                    }
                    drop(hosts);
                    self.ftl.finish_host(id);
                }
            }
        }

        // Sector batching and media traffic.
        self.ftl
            .lba_io
            .pump(&self.ftl, crate::ftl::lba_io::WRITE_Q, now_us);
        self.ftl
            .lba_io
            .pump(&self.ftl, crate::ftl::lba_io::READ_Q, now_us);
        self.ftl.process_media();
        self.ftl
            .lba_io
            .pump(&self.ftl, crate::ftl::lba_io::WRITE_Q, now_us);
        self.ftl
            .lba_io
            .pump(&self.ftl, crate::ftl::lba_io::READ_Q, now_us);

        // Commands the FTL finished flow back through the host queue.
        loop {
            let id = self.ftl.completed.lock().pop_front();
            let id = match id {
                Some(i) => i,
                None => break,
            };
            let ticket = {
                let hosts = self.ftl.hosts.lock();
                hosts.get(id).and_then(|h| h.ticket)
            };
            if let Some(t) = ticket {
                let mut ok = false;
                for _ in 0..self.ftl.cfg.queue_retry {
                    if self.ftl_mq.complete(t).is_ok() {
                        ok = true;
                        break;
                    }
                }
                if !ok {
                    log::error!("[ctrl] host completion queue jammed");
                }
            }
        }

        // Deliver to the front-end.
        for qid in 0..self.ftl.cfg.nq {
            let mut finished = Vec::new();
            self.ftl_mq
                .process_cq(qid, usize::MAX, &mut |id| finished.push(id));
            for id in finished {
                self.complete_to_host(id);
            }
        }

        // Timeout sweeps; a timed-out host command is completed through the
        // CQ with a media-timeout status.
        self.ftl_mq.sweep(now_us, &mut |batch| {
            let mut hosts = self.ftl.hosts.lock();
            for &id in batch {
                if let Some(host) = hosts.get_mut(id) {
                    host.fail(HostStatus::MediaTimeout);
                }
            }
        });
        self.ftl.lba_io.sweep(&self.ftl, now_us);

        self.ftl.gc.run_pass(&self.ftl);
    }

    fn complete_to_host(&self, id: CmdId) {
        let host = match self.ftl.hosts.lock().release(id) {
            Some(h) => h,
            None => return,
        };
        let status = if host.failed {
            host.status
        } else {
            HostStatus::Success
        };
        let data = match host.kind {
            HostKind::Read | HostKind::PhysRead => Some(host.data),
            _ => None,
        };
        self.done.lock().push_back(HostCompletion {
            cid: host.cid,
            status,
            data,
        });
    }

    pub fn pop_completion(&self) -> Option<HostCompletion> {
        self.done.lock().pop_front()
    }

    /// Capability-gated admin dispatch.
    pub fn ftl_cap_exec(&self, req: CapReq<'_>) -> Result<(), CtrlError> {
        match req {
            CapReq::GetBbtbl { ppa, nblk, out } => {
                if !self.ftl.cap.contains(FtlCap::GET_BBTBL) {
                    return Err(CtrlError::Config);
                }
                *out = self.ftl.get_bbtbl(ppa, nblk)?;
                Ok(())
            }
            CapReq::SetBbtbl { ppa, value } => {
                if !self.ftl.cap.contains(FtlCap::SET_BBTBL) {
                    return Err(CtrlError::Config);
                }
                self.ftl.set_bbtbl(ppa, value)?;
                Ok(())
            }
        }
    }

    /// Orderly teardown: persist metadata, then report final queue stats.
    pub fn shutdown(&self) -> Result<(), CtrlError> {
        self.ftl.exit()?;
        self.ftl_mq.log_stats();
        log::info!("[ctrl] controller closed");
        Ok(())
    }
}
