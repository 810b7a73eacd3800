/// Synchronous media helper.
///
/// Bootstrap and metadata paths need media I/O that blocks until completion.
/// A command (or one command per plane for the multi-plane variant) is bound
/// to a shared wait group, submitted, and the media manager is pumped until
/// the group drains or the bounded poll count runs out.
///
/// Completions that belong to someone else may surface while pumping; they
/// are forwarded to the FTL's inbox untouched.
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::mmgr::{MediaError, MediaIoCmd, MediaManager, MediaStatus, WaitGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncIoError {
    Submit(MediaError),
    /// The bounded poll count ran out; the command buffer must not be
    /// reused.
    Timeout,
    /// The media manager reported a per-command failure.
    Media,
}

impl fmt::Display for SyncIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncIoError::Submit(e) => write!(f, "sync submit failed: {}", e),
            SyncIoError::Timeout => write!(f, "sync I/O timed out"),
            SyncIoError::Media => write!(f, "sync I/O failed on media"),
        }
    }
}

/// Queue of completed asynchronous commands surfaced while a synchronous
/// caller was pumping; drained by the FTL completion path.
pub type Inbox = Arc<Mutex<VecDeque<MediaIoCmd>>>;

pub struct SyncIo {
    mm: Arc<dyn MediaManager>,
    inbox: Inbox,
    polls: u32,
}

impl SyncIo {
    pub fn new(mm: Arc<dyn MediaManager>, inbox: Inbox, polls: u32) -> Self {
        Self { mm, inbox, polls }
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Submit one command and wait for it.
    pub fn io(&self, cmd: MediaIoCmd) -> Result<MediaIoCmd, SyncIoError> {
        let mut done = self.multi(alloc::vec![cmd])?;
        Ok(done.pop().unwrap())
    }

    /// Submit a batch sharing one wait group (the multi-plane variant).
    /// All commands complete together or the whole call fails.
    pub fn multi(&self, mut cmds: Vec<MediaIoCmd>) -> Result<Vec<MediaIoCmd>, SyncIoError> {
        let n = cmds.len() as u32;
        let wg = WaitGroup::new(n);
        for cmd in cmds.iter_mut() {
            cmd.sync = Some(wg.clone());
        }
        for cmd in cmds.drain(..) {
            self.mm.submit(cmd).map_err(SyncIoError::Submit)?;
        }

        for _ in 0..self.polls {
            self.mm.process(usize::MAX, &mut |mut done: MediaIoCmd| {
                if let Some(group) = done.sync.take() {
                    group.complete(done);
                } else {
                    self.inbox.lock().push_back(done);
                }
            });
            if wg.remaining() == 0 {
                let done = wg.take_done();
                if done.iter().all(|c| c.status == MediaStatus::Success) {
                    return Ok(done);
                }
                return Err(SyncIoError::Media);
            }
            core::hint::spin_loop();
        }
        Err(SyncIoError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Geometry;
    use crate::mmgr::volt::VoltNand;
    use crate::mmgr::MediaIoCmd;
    use crate::ppa::Ppa;
    use alloc::vec;

    fn geo() -> Geometry {
        Geometry {
            n_of_ch: 1,
            lun_per_ch: 1,
            blk_per_lun: 4,
            pg_per_blk: 4,
            sec_per_pg: 4,
            n_of_planes: 2,
            pg_size: 0x4000,
            sec_oob_sz: 16,
        }
    }

    fn sync_io() -> SyncIo {
        let geo = geo();
        let mm: Arc<dyn MediaManager> = Arc::new(VoltNand::new(geo));
        SyncIo::new(mm, Arc::new(Mutex::new(VecDeque::new())), 16)
    }

    #[test]
    fn blocking_write_read() {
        let geo = geo();
        let s = sync_io();
        let ppa = Ppa::new(0, 0, 0, 1, 0, 0);

        let mut data = vec![0u8; (geo.pg_size + geo.pg_oob_sz()) as usize];
        data[..4].copy_from_slice(&[1, 2, 3, 4]);
        s.io(MediaIoCmd::write_page(ppa, &geo, data)).unwrap();

        let done = s.io(MediaIoCmd::read_page(ppa, &geo)).unwrap();
        assert_eq!(&done.data[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn multi_plane_completes_together() {
        let geo = geo();
        let s = sync_io();
        let cmds = (0..geo.n_of_planes)
            .map(|pl| MediaIoCmd::erase_blk(Ppa::new(0, 0, pl, 2, 0, 0)))
            .collect::<Vec<_>>();
        let done = s.multi(cmds).unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.status == MediaStatus::Success));
    }

    /// Media manager that accepts commands and never completes them.
    struct StuckMedia {
        geo: Geometry,
    }

    impl MediaManager for StuckMedia {
        fn name(&self) -> &str {
            "stuck"
        }
        fn geometry(&self) -> &Geometry {
            &self.geo
        }
        fn channel_info(&self, _ch: u16) -> crate::mmgr::ChannelInfo {
            crate::mmgr::ChannelInfo::default()
        }
        fn set_channel_info(&self, _ch: u16, _info: crate::mmgr::ChannelInfo) {}
        fn reserved_blks(&self) -> &[u16] {
            &[]
        }
        fn submit(&self, _cmd: MediaIoCmd) -> Result<(), crate::mmgr::MediaError> {
            Ok(())
        }
        fn process(&self, _max: usize, _sink: &mut dyn FnMut(MediaIoCmd)) -> usize {
            0
        }
    }

    #[test]
    fn timeout_when_media_never_completes() {
        let geo = geo();
        let s = SyncIo::new(
            Arc::new(StuckMedia { geo }),
            Arc::new(Mutex::new(VecDeque::new())),
            4,
        );
        assert!(matches!(
            s.io(MediaIoCmd::erase_blk(Ppa::new(0, 0, 0, 1, 0, 0))),
            Err(SyncIoError::Timeout)
        ));
    }

    #[test]
    fn media_failure_is_reported() {
        let geo = geo();
        let mm = Arc::new(VoltNand::new(geo));
        let blk = Ppa::new(0, 0, 0, 3, 0, 0);
        mm.fail_next_erase(blk);
        let s = SyncIo::new(mm, Arc::new(Mutex::new(VecDeque::new())), 16);
        assert!(matches!(
            s.io(MediaIoCmd::erase_blk(blk)),
            Err(SyncIoError::Media)
        ));
    }
}
