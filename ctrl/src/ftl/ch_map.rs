/// Per-channel mapping metadata.
///
/// Map pages are spread over the channels round-robin; each channel keeps a
/// directory with one slot per owned page. A slot either names the page's
/// location on media or points at the cache entry currently holding it,
/// never both. On media the distinction is a single tag bit (bit 63), and
/// the serialized form preserves that encoding.
use alloc::vec::Vec;
use spin::Mutex;

use crate::ftl::{FtlChannel, FtlError, META_MAGIC};
use crate::ppa::Ppa;

/// One `(key, ppa)` mapping record, 16 bytes on media.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub lba: u64,
    pub ppa: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<MapEntry>(), 16);

pub const MAP_ENTRY_SZ: usize = 16;

impl MapEntry {
    pub fn read_at(buf: &[u8], idx: usize) -> MapEntry {
        let off = idx * MAP_ENTRY_SZ;
        MapEntry {
            lba: u64::from_le_bytes(buf[off..off + 8].try_into().unwrap_or([0; 8])),
            ppa: u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap_or([0; 8])),
        }
    }

    pub fn write_at(self, buf: &mut [u8], idx: usize) {
        let off = idx * MAP_ENTRY_SZ;
        buf[off..off + 8].copy_from_slice(&self.lba.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&self.ppa.to_le_bytes());
    }
}

const CACHED_TAG: u64 = 1 << 63;

/// Directory slot: the map page's media address, or the cache entry holding
/// it while resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirSlot {
    OnDisk(Ppa),
    Cached(usize),
}

impl DirSlot {
    pub fn encode(self) -> u64 {
        match self {
            DirSlot::OnDisk(ppa) => ppa.raw() & !CACHED_TAG,
            DirSlot::Cached(i) => CACHED_TAG | i as u64,
        }
    }

    pub fn decode(raw: u64) -> DirSlot {
        if raw & CACHED_TAG != 0 {
            DirSlot::Cached((raw & !CACHED_TAG) as usize)
        } else {
            DirSlot::OnDisk(Ppa::from_raw(raw))
        }
    }

    pub fn is_cached(self) -> bool {
        matches!(self, DirSlot::Cached(_))
    }
}

/// On-media OOB header: magic, entry count.
const HDR_LEN: usize = 5;

pub struct MapDirectory {
    /// One mutex per owned map page; load/evict serialize on it.
    pub slots: Vec<Mutex<DirSlot>>,
    ch_idx: u16,
    nch: u16,
}

impl MapDirectory {
    pub fn new(n_slots: usize, ch_idx: u16, nch: u16) -> Self {
        let mut slots = Vec::with_capacity(n_slots);
        for _ in 0..n_slots {
            slots.push(Mutex::new(DirSlot::OnDisk(Ppa::UNMAPPED)));
        }
        Self {
            slots,
            ch_idx,
            nch,
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Global index of the map page behind a slot.
    pub fn global_pg(&self, slot: usize) -> u64 {
        slot as u64 * self.nch as u64 + self.ch_idx as u64
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = alloc::vec![0u8; self.slots.len() * MAP_ENTRY_SZ];
        for (i, slot) in self.slots.iter().enumerate() {
            MapEntry {
                lba: self.global_pg(i),
                ppa: slot.lock().encode(),
            }
            .write_at(&mut out, i);
        }
        out
    }

    fn load_bytes(&self, bytes: &[u8]) {
        for (i, slot) in self.slots.iter().enumerate() {
            let ent = MapEntry::read_at(bytes, i);
            *slot.lock() = DirSlot::decode(ent.ppa);
        }
    }
}

fn header(n_entries: usize) -> [u8; HDR_LEN] {
    let mut h = [0u8; HDR_LEN];
    h[0] = META_MAGIC;
    h[1..5].copy_from_slice(&(n_entries as u32).to_le_bytes());
    h
}

/// Load the persisted directory into `dir`. Returns true when the reserved
/// block is virgin and the fresh directory must be flushed.
pub fn load(ch: &FtlChannel, dir: &MapDirectory) -> Result<bool, FtlError> {
    if dir.n_slots() == 0 {
        return Ok(false);
    }
    match ch.meta_load(ch.map_blk, MAP_ENTRY_SZ, dir.n_slots())? {
        None => Ok(true),
        Some(bytes) => {
            dir.load_bytes(&bytes);
            Ok(false)
        }
    }
}

pub fn flush(ch: &FtlChannel) -> Result<(), FtlError> {
    let dir = match ch.map_md.get() {
        Some(d) => d,
        None => return Ok(()),
    };
    if dir.n_slots() == 0 {
        return Ok(());
    }
    let bytes = dir.to_bytes();
    ch.meta_flush(ch.map_blk, MAP_ENTRY_SZ, &bytes, &header(dir.n_slots()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_encoding_tag_bit() {
        let on_disk = DirSlot::OnDisk(Ppa::new(1, 0, 0, 5, 3, 0));
        let raw = on_disk.encode();
        assert_eq!(raw & CACHED_TAG, 0);
        assert_eq!(DirSlot::decode(raw), on_disk);

        let cached = DirSlot::Cached(7);
        let raw = cached.encode();
        assert_ne!(raw & CACHED_TAG, 0);
        assert_eq!(DirSlot::decode(raw), cached);
    }

    #[test]
    fn entry_round_trip() {
        let mut buf = alloc::vec![0u8; MAP_ENTRY_SZ * 4];
        let ent = MapEntry { lba: 42, ppa: 99 };
        ent.write_at(&mut buf, 2);
        assert_eq!(MapEntry::read_at(&buf, 2), ent);
        assert_eq!(MapEntry::read_at(&buf, 0).lba, 0);
    }

    #[test]
    fn directory_global_page_math() {
        // channel 1 of 3 owns global pages 1, 4, 7, ...
        let dir = MapDirectory::new(3, 1, 3);
        assert_eq!(dir.global_pg(0), 1);
        assert_eq!(dir.global_pg(1), 4);
        assert_eq!(dir.global_pg(2), 7);
    }
}
