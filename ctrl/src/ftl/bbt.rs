/// Per-channel bad-block table.
///
/// One byte per (block × plane), indexed `lun * blk_per_lun * n_pl +
/// blk * n_pl + pl`. Persisted in the reserved BBT block: the table bytes in
/// plane-0 page data, a `{magic, bb_sz, bb_count}` header in plane-0 OOB.
/// The newest copy is found by walking pages until the magic stops matching;
/// when the block fills up it is erased and the walk restarts at page 0.
use alloc::vec;
use alloc::vec::Vec;

use crate::ftl::{FtlChannel, FtlError, META_MAGIC};
use crate::geo::Geometry;
use crate::mmgr::MediaIoCmd;
use crate::ppa::Ppa;

pub const BBT_FREE: u8 = 0x0;
pub const BBT_BAD: u8 = 0x1;
pub const BBT_GROWN_BAD: u8 = 0x2;
pub const BBT_DEVICE_MARK: u8 = 0x4;
pub const BBT_HOST_MARK: u8 = 0x8;

/// Byte pattern written by the full scan before the read-back compare.
const SCAN_PATTERN: u8 = 0xac;

/// On-media OOB header: magic, table size, bad count.
const HDR_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbtMode {
    /// No media scan; only reserved blocks get marked.
    Emergency,
    /// Erase-test every block.
    Erase,
    /// Erase, write a pattern to every page, read back and compare.
    Full,
}

pub struct BadBlockTable {
    tbl: Vec<u8>,
    blk_per_lun: u16,
    n_pl: u8,
}

impl BadBlockTable {
    pub fn new(geo: &Geometry) -> Self {
        let sz = geo.blk_per_lun as usize * geo.lun_per_ch as usize * geo.n_of_planes as usize;
        Self {
            tbl: vec![0u8; sz],
            blk_per_lun: geo.blk_per_lun,
            n_pl: geo.n_of_planes,
        }
    }

    pub fn bb_sz(&self) -> usize {
        self.tbl.len()
    }

    pub fn bb_count(&self) -> u32 {
        self.tbl.iter().filter(|&&b| b != BBT_FREE).count() as u32
    }

    fn index(&self, lun: u8, blk: u16, pl: u8) -> usize {
        lun as usize * self.blk_per_lun as usize * self.n_pl as usize
            + blk as usize * self.n_pl as usize
            + pl as usize
    }

    /// Row of one LUN: `blk_per_lun * n_pl` bytes.
    pub fn lun_row(&self, lun: u8) -> &[u8] {
        let row = self.blk_per_lun as usize * self.n_pl as usize;
        &self.tbl[lun as usize * row..(lun as usize + 1) * row]
    }

    /// True if any plane of the multi-plane block carries a mark.
    pub fn is_bad(&self, lun: u8, blk: u16) -> bool {
        (0..self.n_pl).any(|pl| self.tbl[self.index(lun, blk, pl)] != BBT_FREE)
    }

    pub fn get(&self, lun: u8, blk: u16, pl: u8) -> u8 {
        self.tbl[self.index(lun, blk, pl)]
    }

    /// Set one (block, plane) mark. Returns whether the value changed.
    pub fn mark(&mut self, geo: &Geometry, ppa: Ppa, value: u8) -> Result<bool, FtlError> {
        if ppa.lun() >= geo.lun_per_ch || ppa.blk() >= geo.blk_per_lun || ppa.pl() >= geo.n_of_planes
        {
            return Err(FtlError::OutOfBounds);
        }
        let i = self.index(ppa.lun(), ppa.blk(), ppa.pl());
        let changed = self.tbl[i] != value;
        self.tbl[i] = value;
        Ok(changed)
    }

    /// Mark every plane of a multi-plane block.
    pub fn mark_blk(&mut self, lun: u8, blk: u16, value: u8) {
        for pl in 0..self.n_pl {
            let i = self.index(lun, blk, pl);
            self.tbl[i] = value;
        }
    }

    fn load_bytes(&mut self, bytes: &[u8]) {
        let n = self.tbl.len().min(bytes.len());
        self.tbl[..n].copy_from_slice(&bytes[..n]);
    }
}

fn header(bbt: &BadBlockTable) -> [u8; HDR_LEN] {
    let mut h = [0u8; HDR_LEN];
    h[0] = META_MAGIC;
    h[1..5].copy_from_slice(&(bbt.bb_sz() as u32).to_le_bytes());
    h[5..9].copy_from_slice(&bbt.bb_count().to_le_bytes());
    h
}

/// Load the newest persisted table. Returns true when the reserved block is
/// virgin and the caller must create and flush a fresh one.
pub fn load(ch: &FtlChannel) -> Result<bool, FtlError> {
    if ch.bbt.lock().bb_sz() > ch.geo.pg_size as usize {
        log::error!(
            "[bbt] ch {}: table of {} bytes exceeds one page",
            ch.id,
            ch.bbt.lock().bb_sz()
        );
        return Err(FtlError::MetaOverflow);
    }

    let pg = ch.newest_meta_page(ch.bbt_blk, 1)?;
    if pg == 0 {
        ch.rsv_erase(ch.bbt_blk)?;
        return Ok(true);
    }

    let bufs = ch.rsv_read(ch.bbt_blk, pg - 1)?;
    let mut bbt = ch.bbt.lock();
    let sz = bbt.bb_sz();
    bbt.load_bytes(&bufs[0][..sz]);
    Ok(false)
}

/// Flush the table to the next free page of the reserved block.
pub fn flush(ch: &FtlChannel) -> Result<(), FtlError> {
    let mut pg = ch.newest_meta_page(ch.bbt_blk, 1)?;
    if pg >= ch.geo.pg_per_blk {
        ch.rsv_erase(ch.bbt_blk)?;
        pg = 0;
    }

    let buf_sz = (ch.geo.pg_size + ch.geo.pg_oob_sz()) as usize;
    let mut bufs = vec![vec![0u8; buf_sz]; ch.geo.n_of_planes as usize];
    {
        let bbt = ch.bbt.lock();
        bufs[0][..bbt.bb_sz()].copy_from_slice(&bbt.tbl);
        let hdr = header(&bbt);
        bufs[0][ch.geo.pg_size as usize..ch.geo.pg_size as usize + HDR_LEN].copy_from_slice(&hdr);
    }
    ch.rsv_write(ch.bbt_blk, pg, bufs)
}

/// Build the table: reserved blocks are always marked bad-equivalent so
/// provisioning skips them; `Erase`/`Full` additionally scan the media.
pub fn create(ch: &FtlChannel, mode: BbtMode) -> Result<(), FtlError> {
    {
        let mut bbt = ch.bbt.lock();
        bbt.tbl.fill(BBT_FREE);
        for &blk in ch.mmgr_rsv.iter().chain(ch.ftl_rsv.iter()) {
            bbt.mark_blk(0, blk, BBT_DEVICE_MARK);
        }
    }

    match mode {
        BbtMode::Emergency => {
            log::info!(
                "[bbt] ch {}: emergency table created; a full scan is recommended",
                ch.id
            );
            Ok(())
        }
        BbtMode::Erase | BbtMode::Full => scan(ch, mode),
    }
}

/// Erase-test (and for `Full`, write/read-back) every non-reserved block.
fn scan(ch: &FtlChannel, mode: BbtMode) -> Result<(), FtlError> {
    let geo = &ch.geo;
    log::info!("[bbt] ch {}: scanning for bad blocks...", ch.id);

    for lun in 0..geo.lun_per_ch {
        for blk in 0..geo.blk_per_lun {
            if lun == 0
                && (ch.mmgr_rsv.contains(&blk) || ch.ftl_rsv.contains(&blk))
            {
                continue;
            }
            if check_blk(ch, lun, blk, mode).is_err() {
                log::info!("[bbt] ch {}: bad block: lun {}, blk {}", ch.id, lun, blk);
                ch.bbt.lock().mark_blk(lun, blk, BBT_DEVICE_MARK);
            }
        }
    }
    Ok(())
}

fn check_blk(ch: &FtlChannel, lun: u8, blk: u16, mode: BbtMode) -> Result<(), FtlError> {
    let geo = &ch.geo;
    let buf_sz = (geo.pg_size + geo.pg_oob_sz()) as usize;

    for pl in 0..geo.n_of_planes {
        let base = Ppa::new(ch.mmgr_id, lun, pl, blk, 0, 0);
        ch.sync.io(MediaIoCmd::erase_blk(base))?;
    }
    if mode != BbtMode::Full {
        return Ok(());
    }

    let pattern = vec![SCAN_PATTERN; buf_sz];
    for pg in 0..geo.pg_per_blk {
        for pl in 0..geo.n_of_planes {
            let ppa = Ppa::new(ch.mmgr_id, lun, pl, blk, pg, 0);
            ch.sync
                .io(MediaIoCmd::write_page(ppa, geo, pattern.clone()))?;
        }
    }
    for pg in 0..geo.pg_per_blk {
        for pl in 0..geo.n_of_planes {
            let ppa = Ppa::new(ch.mmgr_id, lun, pl, blk, pg, 0);
            let done = ch.sync.io(MediaIoCmd::read_page(ppa, geo))?;
            if done.data != pattern {
                return Err(FtlError::Media);
            }
        }
    }
    // Leave the block erased for the provisioner.
    for pl in 0..geo.n_of_planes {
        let base = Ppa::new(ch.mmgr_id, lun, pl, blk, 0, 0);
        ch.sync.io(MediaIoCmd::erase_blk(base))?;
    }
    Ok(())
}
