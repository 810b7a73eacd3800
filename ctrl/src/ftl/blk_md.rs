/// Per-channel block metadata.
///
/// One entry per multi-plane block: state flags, erase count, write pointer
/// and a per-sector validity bitmap (bit set ⇒ sector invalid) with its
/// popcount cached in `invalid_sec`. Persisted in the reserved metadata
/// block with the same page-walk scheme as the bad-block table; the table
/// may span several pages.
use alloc::vec;
use alloc::vec::Vec;

use crate::ftl::{FtlChannel, FtlError, META_MAGIC};
use crate::geo::Geometry;
use crate::ppa::Ppa;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlkFlags: u8 {
        const USED = 1 << 0;
        const OPEN = 1 << 1;
    }
}

/// Invalidate granularity: one sector, or every sector of a multi-plane page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grain {
    Page,
    Sector,
}

/// Fixed part of the on-media entry, before the validity bitmap.
const ENTRY_FIXED: usize = 8 + 1 + 2 + 2 + 2;

/// On-media OOB header: magic, entry count, entry size.
const HDR_LEN: usize = 9;

#[derive(Debug, Clone)]
pub struct BlkMdEntry {
    /// Base address of the block (ch, lun, blk).
    pub ppa: Ppa,
    pub flags: BlkFlags,
    pub erase_count: u16,
    pub current_pg: u16,
    pub invalid_sec: u16,
    pub pg_state: Vec<u8>,
}

impl BlkMdEntry {
    fn new(ppa: Ppa, state_bytes: usize) -> Self {
        Self {
            ppa,
            flags: BlkFlags::empty(),
            erase_count: 0,
            current_pg: 0,
            invalid_sec: 0,
            pg_state: vec![0u8; state_bytes],
        }
    }

    pub fn is_closed(&self, geo: &Geometry) -> bool {
        self.flags.contains(BlkFlags::USED)
            && !self.flags.contains(BlkFlags::OPEN)
            && self.current_pg == geo.pg_per_blk
    }

    /// Bit offset of a sector inside the validity bitmap.
    fn sec_bit(geo: &Geometry, pg: u16, pl: u8, sec: u8) -> usize {
        (pg as usize * geo.n_of_planes as usize + pl as usize) * geo.sec_per_pg as usize
            + sec as usize
    }

    pub fn sec_invalid(&self, geo: &Geometry, pg: u16, pl: u8, sec: u8) -> bool {
        let bit = Self::sec_bit(geo, pg, pl, sec);
        self.pg_state[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn set_invalid(&mut self, geo: &Geometry, pg: u16, pl: u8, sec: u8) {
        let bit = Self::sec_bit(geo, pg, pl, sec);
        if self.pg_state[bit / 8] & (1 << (bit % 8)) == 0 {
            self.pg_state[bit / 8] |= 1 << (bit % 8);
            self.invalid_sec += 1;
        }
    }

    /// Ground-truth popcount of the bitmap; `invalid_sec` caches it.
    pub fn count_invalid(&self) -> u32 {
        self.pg_state.iter().map(|b| b.count_ones()).sum()
    }

    pub fn reset(&mut self) {
        self.flags = BlkFlags::USED | BlkFlags::OPEN;
        self.current_pg = 0;
        self.invalid_sec = 0;
        self.pg_state.fill(0);
    }

    fn entry_sz(geo: &Geometry) -> usize {
        ENTRY_FIXED + geo.blk_state_bytes()
    }

    fn to_bytes(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.ppa.raw().to_le_bytes());
        out[8] = self.flags.bits();
        out[9..11].copy_from_slice(&self.erase_count.to_le_bytes());
        out[11..13].copy_from_slice(&self.current_pg.to_le_bytes());
        out[13..15].copy_from_slice(&self.invalid_sec.to_le_bytes());
        out[ENTRY_FIXED..ENTRY_FIXED + self.pg_state.len()].copy_from_slice(&self.pg_state);
    }

    fn from_bytes(b: &[u8], state_bytes: usize) -> Self {
        let mut pg_state = vec![0u8; state_bytes];
        pg_state.copy_from_slice(&b[ENTRY_FIXED..ENTRY_FIXED + state_bytes]);
        Self {
            ppa: Ppa::from_raw(u64::from_le_bytes(b[..8].try_into().unwrap_or([0; 8]))),
            flags: BlkFlags::from_bits_truncate(b[8]),
            erase_count: u16::from_le_bytes([b[9], b[10]]),
            current_pg: u16::from_le_bytes([b[11], b[12]]),
            invalid_sec: u16::from_le_bytes([b[13], b[14]]),
            pg_state,
        }
    }
}

pub struct BlockMetaTable {
    entries: Vec<BlkMdEntry>,
    blk_per_lun: u16,
    entry_sz: usize,
}

impl BlockMetaTable {
    pub fn new(geo: &Geometry, ch_id: u16) -> Self {
        let n = geo.blk_per_ch() as usize;
        let state_bytes = geo.blk_state_bytes();
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let lun = (i / geo.blk_per_lun as usize) as u8;
            let blk = (i % geo.blk_per_lun as usize) as u16;
            entries.push(BlkMdEntry::new(
                Ppa::new(ch_id, lun, 0, blk, 0, 0),
                state_bytes,
            ));
        }
        Self {
            entries,
            blk_per_lun: geo.blk_per_lun,
            entry_sz: BlkMdEntry::entry_sz(geo),
        }
    }

    pub fn entry_sz(&self) -> usize {
        self.entry_sz
    }

    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, lun: u8, blk: u16) -> &BlkMdEntry {
        &self.entries[lun as usize * self.blk_per_lun as usize + blk as usize]
    }

    pub fn get_mut(&mut self, lun: u8, blk: u16) -> &mut BlkMdEntry {
        &mut self.entries[lun as usize * self.blk_per_lun as usize + blk as usize]
    }

    /// All entries of one LUN.
    pub fn lun_row(&self, lun: u8) -> &[BlkMdEntry] {
        let n = self.blk_per_lun as usize;
        &self.entries[lun as usize * n..(lun as usize + 1) * n]
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.entry_sz * self.entries.len()];
        for (i, ent) in self.entries.iter().enumerate() {
            ent.to_bytes(&mut out[i * self.entry_sz..(i + 1) * self.entry_sz]);
        }
        out
    }

    fn load_bytes(&mut self, bytes: &[u8], geo: &Geometry) {
        let state_bytes = geo.blk_state_bytes();
        for i in 0..self.entries.len() {
            self.entries[i] =
                BlkMdEntry::from_bytes(&bytes[i * self.entry_sz..(i + 1) * self.entry_sz], state_bytes);
        }
    }
}

fn header(md: &BlockMetaTable) -> [u8; HDR_LEN] {
    let mut h = [0u8; HDR_LEN];
    h[0] = META_MAGIC;
    h[1..5].copy_from_slice(&(md.n_entries() as u32).to_le_bytes());
    h[5..9].copy_from_slice(&(md.entry_sz() as u32).to_le_bytes());
    h
}

/// Reset every entry to a fresh AVAILABLE state.
pub fn create(ch: &FtlChannel) {
    let mut md = ch.blk_md.lock();
    let state_bytes = ch.geo.blk_state_bytes();
    for ent in md.entries.iter_mut() {
        let ppa = ent.ppa;
        *ent = BlkMdEntry::new(ppa, state_bytes);
    }
}

/// Load the newest persisted table. Returns true when the reserved block is
/// virgin (the caller creates and flushes a fresh table).
pub fn load(ch: &FtlChannel) -> Result<bool, FtlError> {
    let (entry_sz, n_entries) = {
        let md = ch.blk_md.lock();
        (md.entry_sz(), md.n_entries())
    };
    match ch.meta_load(ch.meta_blk, entry_sz, n_entries)? {
        None => Ok(true),
        Some(bytes) => {
            ch.blk_md.lock().load_bytes(&bytes, &ch.geo);
            Ok(false)
        }
    }
}

pub fn flush(ch: &FtlChannel) -> Result<(), FtlError> {
    let (bytes, hdr, entry_sz) = {
        let md = ch.blk_md.lock();
        (md.to_bytes(), header(&md), md.entry_sz())
    };
    ch.meta_flush(ch.meta_blk, entry_sz, &bytes, &hdr)
}

/// Flag sectors invalid, by single sector or whole multi-plane page, under
/// the channel's metadata lock.
pub fn invalidate(ch: &FtlChannel, ppa: Ppa, grain: Grain) {
    let mut md = ch.blk_md.lock();
    let ent = md.get_mut(ppa.lun(), ppa.blk());
    match grain {
        Grain::Sector => ent.set_invalid(&ch.geo, ppa.pg(), ppa.pl(), ppa.sec()),
        Grain::Page => {
            for pl in 0..ch.geo.n_of_planes {
                for sec in 0..ch.geo.sec_per_pg as u8 {
                    ent.set_invalid(&ch.geo, ppa.pg(), pl, sec);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            n_of_ch: 1,
            lun_per_ch: 2,
            blk_per_lun: 4,
            pg_per_blk: 4,
            sec_per_pg: 4,
            n_of_planes: 2,
            pg_size: 0x4000,
            sec_oob_sz: 16,
        }
    }

    #[test]
    fn invalid_count_matches_popcount() {
        let g = geo();
        let mut ent = BlkMdEntry::new(Ppa::new(0, 0, 0, 1, 0, 0), g.blk_state_bytes());
        ent.set_invalid(&g, 0, 0, 1);
        ent.set_invalid(&g, 2, 1, 3);
        ent.set_invalid(&g, 2, 1, 3); // idempotent
        assert_eq!(ent.invalid_sec, 2);
        assert_eq!(ent.count_invalid(), 2);
        assert!(ent.sec_invalid(&g, 0, 0, 1));
        assert!(!ent.sec_invalid(&g, 0, 0, 0));
    }

    #[test]
    fn entry_serialization_round_trip() {
        let g = geo();
        let mut ent = BlkMdEntry::new(Ppa::new(0, 1, 0, 3, 0, 0), g.blk_state_bytes());
        ent.flags = BlkFlags::USED;
        ent.erase_count = 7;
        ent.current_pg = 4;
        ent.set_invalid(&g, 1, 0, 2);

        let sz = BlkMdEntry::entry_sz(&g);
        let mut buf = vec![0u8; sz];
        ent.to_bytes(&mut buf);
        let back = BlkMdEntry::from_bytes(&buf, g.blk_state_bytes());
        assert_eq!(back.ppa, ent.ppa);
        assert_eq!(back.flags, ent.flags);
        assert_eq!(back.erase_count, 7);
        assert_eq!(back.current_pg, 4);
        assert_eq!(back.invalid_sec, 1);
        assert_eq!(back.pg_state, ent.pg_state);
    }

    #[test]
    fn table_addressing_by_lun_and_blk() {
        let g = geo();
        let md = BlockMetaTable::new(&g, 0);
        assert_eq!(md.n_entries(), 8);
        assert_eq!(md.get(1, 2).ppa.lun(), 1);
        assert_eq!(md.get(1, 2).ppa.blk(), 2);
        assert_eq!(md.lun_row(1).len(), 4);
    }

    #[test]
    fn reset_clears_state() {
        let g = geo();
        let mut ent = BlkMdEntry::new(Ppa::new(0, 0, 0, 0, 0, 0), g.blk_state_bytes());
        ent.erase_count = 3;
        ent.current_pg = 4;
        ent.set_invalid(&g, 0, 0, 0);
        ent.reset();
        assert_eq!(ent.flags, BlkFlags::USED | BlkFlags::OPEN);
        assert_eq!(ent.current_pg, 0);
        assert_eq!(ent.invalid_sec, 0);
        assert_eq!(ent.count_invalid(), 0);
        // erase count survives a reset
        assert_eq!(ent.erase_count, 3);
    }
}
