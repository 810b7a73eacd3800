/// PPA I/O.
///
/// Takes a prepared multi-sector command (PPA list already resolved), splits
/// it at single-plane page boundaries into media commands and tracks their
/// completion. Reads copy sector data back into the host buffers; when the
/// last page lands, the owner (LBA scheduler or phys path) is notified.
use alloc::vec;
use alloc::vec::Vec;

use crate::config::FtlConfig;
use crate::ftl::lba_io::LbaCmd;
use crate::ftl::{AppFtl, CmdId, FtlError, HostStatus, PgOob, PgType};
use crate::mmgr::{IoRef, MediaIoCmd, MediaStatus};
use crate::ppa::Ppa;

pub struct PageIo;

impl PageIo {
    pub fn new(_cfg: &FtlConfig) -> Self {
        PageIo
    }

    /// Split `ppas` into runs addressing the same single-plane page.
    fn group(ppas: &[Ppa]) -> Vec<(usize, u16)> {
        let mut groups = Vec::new();
        let mut start = 0;
        for i in 1..=ppas.len() {
            let brk = i == ppas.len() || {
                let (a, b) = (ppas[i - 1], ppas[i]);
                a.ch() != b.ch()
                    || a.lun() != b.lun()
                    || a.blk() != b.blk()
                    || a.pg() != b.pg()
                    || a.pl() != b.pl()
            };
            if brk {
                groups.push((start, (i - start) as u16));
                start = i;
            }
        }
        groups
    }

    /// Issue the media commands for a prepared command in the pool.
    pub fn submit_lcmd(&self, ftl: &AppFtl, lcmd_id: usize) -> Result<(), FtlError> {
        let (ppas, write, secs, direct) = {
            let cmds = ftl.lba_io.cmds.lock();
            let lcmd = cmds.get(lcmd_id).ok_or(FtlError::OutOfBounds)?;
            (
                lcmd.ppas.clone(),
                lcmd.write,
                lcmd.secs.clone(),
                lcmd.direct,
            )
        };
        let groups = Self::group(&ppas);
        {
            let mut cmds = ftl.lba_io.cmds.lock();
            let lcmd = cmds.get_mut(lcmd_id).ok_or(FtlError::OutOfBounds)?;
            lcmd.groups = groups.clone();
            lcmd.total = groups.len() as u16;
            lcmd.pending = groups.len() as u16;
        }

        for (gi, &(start, n)) in groups.iter().enumerate() {
            let base = ppas[start];
            if self
                .issue_group(ftl, lcmd_id, gi, &ppas, start, n, write, &secs, direct)
                .is_err()
            {
                // The page never reached the media; account it as failed so
                // the command still converges.
                log::warn!("[pgio] media submit failed at {:?}", base);
                let done = {
                    let mut cmds = ftl.lba_io.cmds.lock();
                    match cmds.get_mut(lcmd_id) {
                        Some(lcmd) => {
                            lcmd.failed = true;
                            lcmd.pending -= 1;
                            lcmd.pending == 0
                        }
                        None => false,
                    }
                };
                if done {
                    self.finish(ftl, lcmd_id);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_group(
        &self,
        ftl: &AppFtl,
        lcmd_id: usize,
        gi: usize,
        ppas: &[Ppa],
        start: usize,
        n: u16,
        write: bool,
        secs: &[Option<usize>],
        direct: Option<CmdId>,
    ) -> Result<(), FtlError> {
        let base = ppas[start];
        let ch = ftl
            .channels
            .get(base.ch() as usize)
            .ok_or(FtlError::OutOfBounds)?;
        let geo = &ch.geo;

        let mut cmd = if write {
            let mut buf = vec![0u8; (geo.pg_size + geo.pg_oob_sz()) as usize];
            for k in 0..n as usize {
                let ppa = ppas[start + k];
                let sec = ppa.sec() as usize;
                let sec_sz = geo.sec_size() as usize;
                let (data, oob) = self.sector_source(ftl, secs, direct, start + k)?;
                buf[sec * sec_sz..(sec + 1) * sec_sz].copy_from_slice(&data);
                let off = geo.pg_size as usize + sec * geo.sec_oob_sz as usize;
                let rec = oob.to_bytes();
                buf[off..off + rec.len()].copy_from_slice(&rec);
            }
            MediaIoCmd::write_page(base.with_sec(0), geo, buf)
        } else {
            MediaIoCmd::read_page(base.with_sec(0), geo)
        };
        cmd.io = Some(IoRef {
            cmd: lcmd_id as u32,
            pg: gi as u16,
        });

        ftl.mm.submit(cmd).map_err(|_| FtlError::Media)
    }

    /// Fetch the write payload and OOB record feeding one PPA slot.
    fn sector_source(
        &self,
        ftl: &AppFtl,
        secs: &[Option<usize>],
        direct: Option<CmdId>,
        idx: usize,
    ) -> Result<(Vec<u8>, PgOob), FtlError> {
        if let Some(host_id) = direct {
            let hosts = ftl.hosts.lock();
            let host = hosts.get(host_id).ok_or(FtlError::OutOfBounds)?;
            return Ok((
                host.data[idx].clone(),
                PgOob {
                    lba: 0,
                    pg_type: PgType::Padding,
                },
            ));
        }
        match secs.get(idx).copied().flatten() {
            Some(sec_id) => {
                let secs_pool = ftl.lba_io.secs.lock();
                let sec = secs_pool.get(sec_id).ok_or(FtlError::OutOfBounds)?;
                let (cmd, lba, lba_id) = (sec.cmd, sec.lba, sec.lba_id);
                drop(secs_pool);
                let hosts = ftl.hosts.lock();
                let host = hosts.get(cmd).ok_or(FtlError::OutOfBounds)?;
                Ok((
                    host.data[lba_id as usize].clone(),
                    PgOob {
                        lba,
                        pg_type: PgType::Namespace,
                    },
                ))
            }
            None => {
                // Padding slot: repeat the first bound sector's payload.
                let first = secs
                    .iter()
                    .copied()
                    .flatten()
                    .next()
                    .ok_or(FtlError::OutOfBounds)?;
                let secs_pool = ftl.lba_io.secs.lock();
                let sec = secs_pool.get(first).ok_or(FtlError::OutOfBounds)?;
                let (cmd, lba_id) = (sec.cmd, sec.lba_id);
                drop(secs_pool);
                let hosts = ftl.hosts.lock();
                let host = hosts.get(cmd).ok_or(FtlError::OutOfBounds)?;
                Ok((
                    host.data[lba_id as usize].clone(),
                    PgOob {
                        lba: 0,
                        pg_type: PgType::Padding,
                    },
                ))
            }
        }
    }

    /// Media completion for one page of a command.
    pub fn complete(&self, ftl: &AppFtl, media: MediaIoCmd) {
        let ioref = match media.io {
            Some(r) => r,
            None => return,
        };
        let lcmd_id = ioref.cmd as usize;

        let done = {
            let mut cmds = ftl.lba_io.cmds.lock();
            let lcmd = match cmds.get_mut(lcmd_id) {
                Some(c) => c,
                None => return,
            };
            if media.status != MediaStatus::Success {
                lcmd.failed = true;
            } else if !lcmd.write {
                self.copy_read_out(ftl, lcmd, ioref.pg as usize, &media);
            }
            lcmd.pending -= 1;
            lcmd.pending == 0
        };
        if done {
            self.finish(ftl, lcmd_id);
        }
    }

    fn copy_read_out(&self, ftl: &AppFtl, lcmd: &LbaCmd, group: usize, media: &MediaIoCmd) {
        let (start, n) = lcmd.groups[group];
        let geo = ftl.channels[media.ppa.ch() as usize].geo;
        for k in 0..n as usize {
            let ppa = lcmd.ppas[start + k];
            let data = media.sector(&geo, ppa.sec() as usize);
            if let Some(host_id) = lcmd.direct {
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(host_id) {
                    host.data[start + k].copy_from_slice(data);
                }
                continue;
            }
            if let Some(sec_id) = lcmd.secs.get(start + k).copied().flatten() {
                let (cmd, lba_id) = {
                    let secs = ftl.lba_io.secs.lock();
                    match secs.get(sec_id) {
                        Some(s) => (s.cmd, s.lba_id),
                        None => continue,
                    }
                };
                let mut hosts = ftl.hosts.lock();
                if let Some(host) = hosts.get_mut(cmd) {
                    host.data[lba_id as usize].copy_from_slice(data);
                }
            }
        }
    }

    fn finish(&self, ftl: &AppFtl, lcmd_id: usize) {
        let direct = {
            let cmds = ftl.lba_io.cmds.lock();
            cmds.get(lcmd_id).and_then(|c| c.direct)
        };
        match direct {
            Some(host_id) => self.phys_done(ftl, lcmd_id, host_id),
            None => ftl.lba_io.lcmd_done(ftl, lcmd_id),
        }
    }

    /// Phys commands complete straight to the host; no mapping involved.
    fn phys_done(&self, ftl: &AppFtl, lcmd_id: usize, host_id: CmdId) {
        let failed = {
            let mut cmds = ftl.lba_io.cmds.lock();
            match cmds.release(lcmd_id) {
                Some(lcmd) => {
                    if let Some(prov) = lcmd.prov {
                        ftl.gl_prov.free_ppa_list(ftl, prov);
                    }
                    lcmd.failed
                }
                None => return,
            }
        };
        {
            let mut hosts = ftl.hosts.lock();
            if let Some(host) = hosts.get_mut(host_id) {
                if failed {
                    host.fail(HostStatus::DataTrasError);
                }
                host.done = true;
            }
        }
        ftl.finish_host(host_id);
    }

    /// Host-supplied PPA list: validate and issue directly.
    pub fn submit_phys(&self, ftl: &AppFtl, host_id: CmdId) -> Result<(), FtlError> {
        let (ppas, write, n_sec) = {
            let hosts = ftl.hosts.lock();
            let host = hosts.get(host_id).ok_or(FtlError::OutOfBounds)?;
            (host.ppas.clone(), host.kind.is_write(), host.n_sec)
        };
        if ppas.len() != n_sec as usize || ppas.is_empty() {
            return Err(FtlError::OutOfBounds);
        }
        for ppa in &ppas {
            if ppa.ch() as usize >= ftl.nch() {
                return Err(FtlError::OutOfBounds);
            }
        }

        let lcmd = LbaCmd {
            write,
            secs: Vec::new(),
            ppas,
            prov: None,
            pending: 0,
            total: 0,
            failed: false,
            groups: Vec::new(),
            direct: Some(host_id),
        };
        let lcmd_id = ftl
            .lba_io
            .cmds
            .lock()
            .alloc(lcmd)
            .ok_or(FtlError::PoolExhausted)?;
        self.submit_lcmd(ftl, lcmd_id)
    }
}
