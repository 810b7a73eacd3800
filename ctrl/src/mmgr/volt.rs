/// Volatile RAM media manager.
///
/// Emulates NAND-style media entirely in memory: per-plane pages with data
/// and OOB areas, block erase with a finite lifetime, and asynchronous
/// completion through an internal queue drained by `process`. Used as the
/// default back-end and by every test in the crate.
///
/// Fault injection: tests can arm erase/write failures for specific
/// addresses to drive the bad-block and rollback paths.
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::geo::Geometry;
use crate::mmgr::{
    ChannelInfo, MediaCmdKind, MediaError, MediaIoCmd, MediaManager, MediaStatus,
};
use crate::ppa::Ppa;

/// Default layout, one of the geometries the real hardware ships with.
pub const VOLT_GEOMETRY: Geometry = Geometry {
    n_of_ch: 8,
    lun_per_ch: 4,
    blk_per_lun: 32,
    pg_per_blk: 128,
    sec_per_pg: 4,
    n_of_planes: 2,
    pg_size: 0x4000,
    sec_oob_sz: 0x400 / 4,
};

/// Erases a block survives before it grows bad.
pub const VOLT_BLK_LIFE: u32 = 5000;

struct VoltBlock {
    erases: u32,
    /// Page data + OOB, `pg_per_blk` slots.
    data: Vec<u8>,
    written: Vec<bool>,
}

struct VoltInner {
    blocks: Vec<VoltBlock>,
    ch_info: Vec<u64>,
    queue: VecDeque<MediaIoCmd>,
    fail_erase: Vec<u64>,
    fail_write: Vec<u64>,
    fail_erases_left: u32,
    reads: u64,
    writes: u64,
    erases: u64,
}

pub struct VoltNand {
    name: String,
    geo: Geometry,
    blk_life: u32,
    rsv: Vec<u16>,
    inner: Mutex<VoltInner>,
}

impl VoltNand {
    pub fn new(geo: Geometry) -> Self {
        Self::with_life(geo, VOLT_BLK_LIFE)
    }

    pub fn with_life(geo: Geometry, blk_life: u32) -> Self {
        let pg_bytes = (geo.pg_size + geo.pg_oob_sz()) as usize;
        let n_blks =
            geo.n_of_ch as usize * geo.lun_per_ch as usize * geo.blk_per_lun as usize
                * geo.n_of_planes as usize;
        let mut blocks = Vec::with_capacity(n_blks);
        for _ in 0..n_blks {
            blocks.push(VoltBlock {
                erases: 0,
                data: vec![0u8; pg_bytes * geo.pg_per_blk as usize],
                written: vec![false; geo.pg_per_blk as usize],
            });
        }
        log::info!(
            "[volt] started: {} plane-blocks, {} KiB resident",
            n_blks,
            n_blks * pg_bytes * geo.pg_per_blk as usize / 1024
        );
        Self {
            name: String::from("VOLT"),
            geo,
            blk_life,
            // RAM media needs no reserved blocks of its own; channel identity
            // lives outside the page store.
            rsv: Vec::new(),
            inner: Mutex::new(VoltInner {
                blocks,
                ch_info: vec![0u64; geo.n_of_ch as usize],
                queue: VecDeque::new(),
                fail_erase: Vec::new(),
                fail_write: Vec::new(),
                fail_erases_left: 0,
                reads: 0,
                writes: 0,
                erases: 0,
            }),
        }
    }

    /// Arm a one-shot erase failure for a (ch, lun, pl, blk) address.
    pub fn fail_next_erase(&self, ppa: Ppa) {
        self.inner.lock().fail_erase.push(ppa.blk_base().with_pl(ppa.pl()).raw());
    }

    /// Arm a one-shot write failure for a (ch, lun, pl, blk, pg) address.
    pub fn fail_next_write(&self, ppa: Ppa) {
        self.inner.lock().fail_write.push(ppa.with_sec(0).raw());
    }

    /// Fail the next `n` erase operations, whatever they address.
    pub fn fail_erases(&self, n: u32) {
        self.inner.lock().fail_erases_left = n;
    }

    /// (reads, writes, erases) executed so far, for test assertions.
    pub fn op_counts(&self) -> (u64, u64, u64) {
        let g = self.inner.lock();
        (g.reads, g.writes, g.erases)
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn blk_index(&self, ppa: Ppa) -> Option<usize> {
        let g = &self.geo;
        if ppa.ch() >= g.n_of_ch as u16
            || ppa.lun() >= g.lun_per_ch
            || ppa.blk() >= g.blk_per_lun
            || ppa.pl() >= g.n_of_planes
        {
            return None;
        }
        let luns = g.lun_per_ch as usize;
        let blks = g.blk_per_lun as usize;
        let pls = g.n_of_planes as usize;
        Some(
            ((ppa.ch() as usize * luns + ppa.lun() as usize) * blks + ppa.blk() as usize) * pls
                + ppa.pl() as usize,
        )
    }

    fn execute(&self, inner: &mut VoltInner, cmd: &mut MediaIoCmd) {
        let pg_bytes = (self.geo.pg_size + self.geo.pg_oob_sz()) as usize;
        let idx = match self.blk_index(cmd.ppa) {
            Some(i) => i,
            None => {
                cmd.status = MediaStatus::Fail;
                return;
            }
        };

        match cmd.kind {
            MediaCmdKind::ReadPage => {
                if cmd.ppa.pg() >= self.geo.pg_per_blk {
                    cmd.status = MediaStatus::Fail;
                    return;
                }
                inner.reads += 1;
                let off = cmd.ppa.pg() as usize * pg_bytes;
                cmd.data
                    .copy_from_slice(&inner.blocks[idx].data[off..off + pg_bytes]);
                cmd.status = MediaStatus::Success;
            }
            MediaCmdKind::WritePage => {
                if cmd.ppa.pg() >= self.geo.pg_per_blk {
                    cmd.status = MediaStatus::Fail;
                    return;
                }
                let key = cmd.ppa.with_sec(0).raw();
                if let Some(at) = inner.fail_write.iter().position(|&f| f == key) {
                    inner.fail_write.swap_remove(at);
                    cmd.status = MediaStatus::Fail;
                    return;
                }
                inner.writes += 1;
                let off = cmd.ppa.pg() as usize * pg_bytes;
                inner.blocks[idx].data[off..off + pg_bytes].copy_from_slice(&cmd.data);
                let pg = cmd.ppa.pg() as usize;
                inner.blocks[idx].written[pg] = true;
                cmd.status = MediaStatus::Success;
            }
            MediaCmdKind::EraseBlock => {
                if inner.fail_erases_left > 0 {
                    inner.fail_erases_left -= 1;
                    cmd.status = MediaStatus::Fail;
                    return;
                }
                let key = cmd.ppa.blk_base().with_pl(cmd.ppa.pl()).raw();
                if let Some(at) = inner.fail_erase.iter().position(|&f| f == key) {
                    inner.fail_erase.swap_remove(at);
                    cmd.status = MediaStatus::Fail;
                    return;
                }
                if inner.blocks[idx].erases >= self.blk_life {
                    // Worn out; the block has grown bad.
                    cmd.status = MediaStatus::Fail;
                    return;
                }
                inner.erases += 1;
                let blk = &mut inner.blocks[idx];
                blk.erases += 1;
                blk.data.fill(0);
                blk.written.fill(false);
                cmd.status = MediaStatus::Success;
            }
        }
    }
}

impl MediaManager for VoltNand {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> &Geometry {
        &self.geo
    }

    fn channel_info(&self, ch: u16) -> ChannelInfo {
        ChannelInfo::unpack(self.inner.lock().ch_info[ch as usize])
    }

    fn set_channel_info(&self, ch: u16, info: ChannelInfo) {
        self.inner.lock().ch_info[ch as usize] = info.pack();
    }

    fn reserved_blks(&self) -> &[u16] {
        &self.rsv
    }

    fn submit(&self, cmd: MediaIoCmd) -> Result<(), MediaError> {
        match cmd.kind {
            MediaCmdKind::EraseBlock => {}
            _ => {
                let expect = (self.geo.pg_size + self.geo.pg_oob_sz()) as usize;
                if cmd.data.len() != expect {
                    return Err(MediaError::Geometry);
                }
            }
        }
        if self.blk_index(cmd.ppa).is_none() {
            return Err(MediaError::Geometry);
        }
        self.inner.lock().queue.push_back(cmd);
        Ok(())
    }

    fn process(&self, max: usize, sink: &mut dyn FnMut(MediaIoCmd)) -> usize {
        let mut n = 0;
        while n < max {
            let cmd = {
                let mut g = self.inner.lock();
                match g.queue.pop_front() {
                    Some(mut cmd) => {
                        self.execute(&mut g, &mut cmd);
                        cmd
                    }
                    None => break,
                }
            };
            if cmd.status == MediaStatus::Fail {
                log::warn!("[volt] failed {:?} at {:?}", cmd.kind, cmd.ppa);
            }
            sink(cmd);
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn small_geo() -> Geometry {
        Geometry {
            n_of_ch: 1,
            lun_per_ch: 1,
            blk_per_lun: 4,
            pg_per_blk: 4,
            sec_per_pg: 4,
            n_of_planes: 1,
            pg_size: 0x4000,
            sec_oob_sz: 16,
        }
    }

    fn drain(volt: &VoltNand) -> Vec<MediaIoCmd> {
        let mut out = Vec::new();
        volt.process(usize::MAX, &mut |c| out.push(c));
        out
    }

    #[test]
    fn write_then_read_round_trip() {
        let geo = small_geo();
        let volt = VoltNand::new(geo);
        let ppa = Ppa::new(0, 0, 0, 1, 2, 0);
        let mut data = vec![0u8; (geo.pg_size + geo.pg_oob_sz()) as usize];
        data[..8].copy_from_slice(b"sentinel");

        volt.submit(MediaIoCmd::write_page(ppa, &geo, data)).unwrap();
        let done = drain(&volt);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, MediaStatus::Success);

        volt.submit(MediaIoCmd::read_page(ppa, &geo)).unwrap();
        let done = drain(&volt);
        assert_eq!(&done[0].data[..8], b"sentinel");
    }

    #[test]
    fn erase_clears_block() {
        let geo = small_geo();
        let volt = VoltNand::new(geo);
        let ppa = Ppa::new(0, 0, 0, 1, 0, 0);
        let mut data = vec![0u8; (geo.pg_size + geo.pg_oob_sz()) as usize];
        data[0] = 0xaa;
        volt.submit(MediaIoCmd::write_page(ppa, &geo, data)).unwrap();
        drain(&volt);

        volt.submit(MediaIoCmd::erase_blk(ppa.blk_base())).unwrap();
        let done = drain(&volt);
        assert_eq!(done[0].status, MediaStatus::Success);

        volt.submit(MediaIoCmd::read_page(ppa, &geo)).unwrap();
        let done = drain(&volt);
        assert!(done[0].data.iter().all(|&b| b == 0));
    }

    #[test]
    fn armed_erase_failure_fires_once() {
        let geo = small_geo();
        let volt = VoltNand::new(geo);
        let blk = Ppa::new(0, 0, 0, 2, 0, 0);
        volt.fail_next_erase(blk);

        volt.submit(MediaIoCmd::erase_blk(blk)).unwrap();
        assert_eq!(drain(&volt)[0].status, MediaStatus::Fail);

        volt.submit(MediaIoCmd::erase_blk(blk)).unwrap();
        assert_eq!(drain(&volt)[0].status, MediaStatus::Success);
    }

    #[test]
    fn out_of_bounds_rejected_at_submit() {
        let geo = small_geo();
        let volt = VoltNand::new(geo);
        let bad = Ppa::new(0, 0, 0, 99, 0, 0);
        assert!(volt.submit(MediaIoCmd::erase_blk(bad)).is_err());
    }

    #[test]
    fn channel_info_round_trip() {
        let geo = small_geo();
        let volt = VoltNand::new(geo);
        let info = ChannelInfo {
            ns_id: 1,
            ns_part: 7,
            ftl_id: 2,
            in_use: crate::mmgr::CH_IN_USE,
        };
        volt.set_channel_info(0, info);
        assert_eq!(volt.channel_info(0), info);
        assert!(volt.channel_info(0).is_in_use());
    }
}
