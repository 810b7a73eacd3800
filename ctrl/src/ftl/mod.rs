/// Application FTL.
///
/// Per channel: a bad-block table, block metadata and a provisioner working
/// over per-LUN block lists. Globally: round-robin page provisioning across
/// active channels, a paged logical-to-physical map with per-channel caches,
/// the LBA scheduler that batches host sectors into plane-page I/Os, and the
/// garbage collector.
pub mod bbt;
pub mod blk_md;
pub mod ch_map;
pub mod ch_prov;
pub mod gc;
pub mod gl_map;
pub mod gl_prov;
pub mod lba_io;
pub mod page_io;

#[cfg(test)]
mod tests;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::{Mutex, Once};

use crate::config::FtlConfig;
use crate::geo::Geometry;
use crate::mmgr::{MediaIoCmd, MediaManager};
use crate::mq::MqTicket;
use crate::ppa::Ppa;
use crate::rng::XorShift64;
use crate::sync::{SyncIo, SyncIoError};

use bbt::BadBlockTable;
use blk_md::BlockMetaTable;
use ch_map::MapDirectory;
use ch_prov::ChProv;
use gc::Gc;
use gl_map::{GlMap, MapCache};
use gl_prov::GlProv;
use lba_io::LbaIo;
use page_io::PageIo;

/// Magic byte stamped into plane-0 OOB of every persisted metadata page.
pub const META_MAGIC: u8 = 0x3c;

/// Blocks the FTL reserves per channel, right after the media manager's own.
pub const RSV_BLK_COUNT: u16 = 3;
const RSV_BBT_OFF: u16 = 0;
const RSV_META_OFF: u16 = 1;
const RSV_MAP_OFF: u16 = 2;

pub const FTL_ID_APP: u8 = 0x2;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FtlCap: u32 {
        const GET_BBTBL = 1 << 0;
        const SET_BBTBL = 1 << 1;
        const GET_L2P   = 1 << 2;
        const SET_L2P   = 1 << 3;
        const INIT_FN   = 1 << 4;
        const EXIT_FN   = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtlError {
    /// Media or synchronous I/O failure.
    Media,
    Timeout,
    /// A metadata table does not fit its reserved block.
    MetaOverflow,
    /// The channel has no block left to open.
    NoFreeBlocks,
    /// No active channel accepted the allocation.
    NoActiveChannels,
    OutOfBounds,
    /// A cached map entry does not carry the expected LBA.
    MapMismatch,
    QueueFull,
    PoolExhausted,
    /// put/get precondition on the block state failed.
    BlockState,
}

impl fmt::Display for FtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtlError::Media => write!(f, "media I/O failed"),
            FtlError::Timeout => write!(f, "media I/O timed out"),
            FtlError::MetaOverflow => write!(f, "metadata table exceeds reserved block"),
            FtlError::NoFreeBlocks => write!(f, "no free blocks"),
            FtlError::NoActiveChannels => write!(f, "no active channels"),
            FtlError::OutOfBounds => write!(f, "address out of bounds"),
            FtlError::MapMismatch => write!(f, "mapping entry mismatch"),
            FtlError::QueueFull => write!(f, "queue full"),
            FtlError::PoolExhausted => write!(f, "resource pool exhausted"),
            FtlError::BlockState => write!(f, "invalid block state"),
        }
    }
}

impl From<SyncIoError> for FtlError {
    fn from(e: SyncIoError) -> Self {
        match e {
            SyncIoError::Timeout => FtlError::Timeout,
            _ => FtlError::Media,
        }
    }
}

/// NVMe-level status surfaced at the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Success,
    CmdAbortReq,
    LbaRange,
    InvalidField,
    CapExceeded,
    DataTrasError,
    MediaTimeout,
    InternalDevError,
}

/// Per-sector page classification, stored in the sector's OOB area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PgType {
    Padding = 0,
    Namespace = 1,
    Map = 2,
}

/// Per-sector OOB record: `{u64 lba, u8 pg_type}`, 9 bytes on media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgOob {
    pub lba: u64,
    pub pg_type: PgType,
}

pub const PG_OOB_SZ: usize = 9;

impl PgOob {
    pub fn to_bytes(self) -> [u8; PG_OOB_SZ] {
        let mut b = [0u8; PG_OOB_SZ];
        b[..8].copy_from_slice(&self.lba.to_le_bytes());
        b[8] = self.pg_type as u8;
        b
    }

    pub fn from_bytes(b: &[u8]) -> PgOob {
        let lba = u64::from_le_bytes(b[..8].try_into().unwrap_or([0; 8]));
        let pg_type = match b.get(8) {
            Some(1) => PgType::Namespace,
            Some(2) => PgType::Map,
            _ => PgType::Padding,
        };
        PgOob { lba, pg_type }
    }
}

/// Fixed-capacity slot pool with a free list.
pub struct Pool<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Pool<T> {
    pub fn new(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap);
        for _ in 0..cap {
            slots.push(None);
        }
        Self {
            slots,
            free: (0..cap).rev().collect(),
        }
    }

    pub fn alloc(&mut self, item: T) -> Option<usize> {
        let id = self.free.pop()?;
        self.slots[id] = Some(item);
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    pub fn release(&mut self, id: usize) -> Option<T> {
        let item = self.slots.get_mut(id)?.take();
        if item.is_some() {
            self.free.push(id);
        }
        item
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

pub type CmdId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Read,
    Write,
    /// Host-supplied PPA list, mapping layer bypassed.
    PhysRead,
    PhysWrite,
}

impl HostKind {
    pub fn is_write(self) -> bool {
        matches!(self, HostKind::Write | HostKind::PhysWrite)
    }

    pub fn is_phys(self) -> bool {
        matches!(self, HostKind::PhysRead | HostKind::PhysWrite)
    }
}

/// Journal entry for the deferred map upsert of one written sector.
#[derive(Debug, Clone, Copy)]
pub struct SecSaved {
    pub lba: u64,
    pub new_ppa: Ppa,
    pub old_ppa: Ppa,
}

/// One host command, held by the FTL from submission to completion.
pub struct HostCmd {
    pub cid: u64,
    pub kind: HostKind,
    pub slba: u64,
    pub n_sec: u32,
    /// One buffer per sector: payload for writes, destination for reads.
    pub data: Vec<Vec<u8>>,
    /// Host-supplied addresses for phys commands.
    pub ppas: Vec<Ppa>,
    pub status: HostStatus,
    pub failed: bool,
    /// Sectors accounted (completed, failed or timed out).
    pub pgs_p: u32,
    pub saved: Vec<SecSaved>,
    pub ticket: Option<MqTicket>,
    pub done: bool,
}

impl HostCmd {
    pub fn new(cid: u64, kind: HostKind, slba: u64, n_sec: u32, data: Vec<Vec<u8>>) -> Self {
        Self {
            cid,
            kind,
            slba,
            n_sec,
            data,
            ppas: Vec::new(),
            status: HostStatus::Success,
            failed: false,
            pgs_p: 0,
            saved: Vec::new(),
            ticket: None,
            done: false,
        }
    }

    pub fn fail(&mut self, status: HostStatus) {
        self.failed = true;
        self.status = status;
    }
}

/// One FTL-managed channel: geometry view, namespace subrange, reserved
/// blocks, metadata tables and the per-LUN provisioner.
pub struct FtlChannel {
    pub id: u16,
    pub mmgr_id: u16,
    pub geo: Geometry,
    pub slba: u64,
    pub elba: u64,
    pub tot_bytes: u64,
    pub ns_sectors: u64,
    pub mmgr_rsv: Vec<u16>,
    pub ftl_rsv: Vec<u16>,
    pub bbt_blk: u16,
    pub meta_blk: u16,
    pub map_blk: u16,
    pub bbt: Mutex<BadBlockTable>,
    pub blk_md: Mutex<BlockMetaTable>,
    pub prov: ChProv,
    pub map_md: Once<MapDirectory>,
    pub map_cache: Once<MapCache>,
    pub sync: Arc<SyncIo>,
    busy: AtomicU32,
    active: AtomicBool,
    need_gc: AtomicBool,
}

impl FtlChannel {
    /// Bring a channel up: reserve metadata blocks, load or create the
    /// bad-block table and block metadata, build the provisioner lists.
    pub fn init(
        id: u16,
        mmgr_id: u16,
        mm: &dyn MediaManager,
        sync: Arc<SyncIo>,
        seed: u64,
    ) -> Result<FtlChannel, FtlError> {
        let geo = *mm.geometry();
        let mmgr_rsv: Vec<u16> = mm.reserved_blks().to_vec();
        let base = mmgr_rsv.iter().copied().max().map(|b| b + 1).unwrap_or(0);
        if base + RSV_BLK_COUNT >= geo.blk_per_lun {
            return Err(FtlError::MetaOverflow);
        }
        let ftl_rsv: Vec<u16> = (base..base + RSV_BLK_COUNT).collect();

        let rsv_total = (mmgr_rsv.len() + ftl_rsv.len()) as u64;
        let user_blks = geo.blk_per_ch() as u64 - rsv_total;
        let ns_sectors = user_blks * geo.sec_per_blk() as u64;

        let ch = FtlChannel {
            id,
            mmgr_id,
            geo,
            slba: 0,
            elba: 0,
            tot_bytes: ns_sectors * geo.sec_size() as u64,
            ns_sectors,
            mmgr_rsv,
            ftl_rsv: ftl_rsv.clone(),
            bbt_blk: base + RSV_BBT_OFF,
            meta_blk: base + RSV_META_OFF,
            map_blk: base + RSV_MAP_OFF,
            bbt: Mutex::new(BadBlockTable::new(&geo)),
            blk_md: Mutex::new(BlockMetaTable::new(&geo, id)),
            prov: ChProv::new(&geo),
            map_md: Once::new(),
            map_cache: Once::new(),
            sync,
            busy: AtomicU32::new(0),
            active: AtomicBool::new(false),
            need_gc: AtomicBool::new(false),
        };

        let fresh = bbt::load(&ch)?;
        if fresh {
            bbt::create(&ch, bbt::BbtMode::Emergency)?;
            bbt::flush(&ch)?;
        }

        let fresh = blk_md::load(&ch)?;
        if fresh {
            blk_md::create(&ch);
            blk_md::flush(&ch)?;
        }

        let mut rng = XorShift64::new(seed ^ (id as u64) << 32);
        ch.prov.build(&ch, &mut rng);

        ch.active_set();
        ch.need_gc_unset();

        log::info!(
            "[ftl] channel {} started with {} bad blocks",
            id,
            ch.bbt.lock().bb_count()
        );
        Ok(ch)
    }

    // ---- active / need_gc / busy flags ----

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn active_set(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn active_unset(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn need_gc(&self) -> bool {
        self.need_gc.load(Ordering::Acquire)
    }

    pub fn need_gc_set(&self) {
        self.need_gc.store(true, Ordering::Release);
    }

    pub fn need_gc_unset(&self) {
        self.need_gc.store(false, Ordering::Release);
    }

    /// Take a busy reference. The increment is verified against the active
    /// flag so a channel being disabled cannot gain new users.
    pub fn inc_busy(&self) -> bool {
        self.busy.fetch_add(1, Ordering::AcqRel);
        if !self.is_active() {
            self.busy.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn dec_busy(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn nthreads(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    // ---- reserved-block I/O (metadata page walk) ----

    fn rsv_ppa(&self, blk: u16, pl: u8, pg: u16) -> Ppa {
        Ppa::new(self.mmgr_id, 0, pl, blk, pg, 0)
    }

    pub fn rsv_erase(&self, blk: u16) -> Result<(), FtlError> {
        let cmds = (0..self.geo.n_of_planes)
            .map(|pl| MediaIoCmd::erase_blk(self.rsv_ppa(blk, pl, 0)))
            .collect();
        self.sync.multi(cmds)?;
        Ok(())
    }

    /// Write one multi-plane page of a reserved block; one buffer per plane.
    pub fn rsv_write(&self, blk: u16, pg: u16, bufs: Vec<Vec<u8>>) -> Result<(), FtlError> {
        let cmds = bufs
            .into_iter()
            .enumerate()
            .map(|(pl, buf)| MediaIoCmd::write_page(self.rsv_ppa(blk, pl as u8, pg), &self.geo, buf))
            .collect();
        self.sync.multi(cmds)?;
        Ok(())
    }

    /// Read one multi-plane page of a reserved block; buffers in plane order.
    pub fn rsv_read(&self, blk: u16, pg: u16) -> Result<Vec<Vec<u8>>, FtlError> {
        let cmds = (0..self.geo.n_of_planes)
            .map(|pl| MediaIoCmd::read_page(self.rsv_ppa(blk, pl, pg), &self.geo))
            .collect();
        let mut done = self.sync.multi(cmds)?;
        // completions arrive unordered; restore plane order
        done.sort_by_key(|c| c.ppa.pl());
        Ok(done.into_iter().map(|c| c.data).collect())
    }

    /// Walk a reserved block in `step`-page strides until the magic byte in
    /// plane-0 OOB no longer matches. Returns the first non-matching page:
    /// 0 means the block is virgin.
    pub fn newest_meta_page(&self, blk: u16, step: u16) -> Result<u16, FtlError> {
        let mut pg = 0;
        while pg < self.geo.pg_per_blk {
            let bufs = self.rsv_read(blk, pg)?;
            let oob = &bufs[0][self.geo.pg_size as usize..];
            if oob[0] != META_MAGIC {
                break;
            }
            pg += step;
        }
        Ok(pg)
    }

    /// Entries of one multi-plane metadata page for a given entry size.
    pub fn meta_ent_per_pg(&self, entry_sz: usize) -> usize {
        (self.geo.pg_size as usize / entry_sz) * self.geo.n_of_planes as usize
    }

    fn meta_pgs(&self, entry_sz: usize, n_entries: usize) -> Result<u16, FtlError> {
        let per_pg = self.meta_ent_per_pg(entry_sz);
        let pgs = (n_entries + per_pg - 1) / per_pg;
        if pgs > self.geo.pg_per_blk as usize {
            log::error!(
                "[ftl] ch {}: metadata table of {} entries exceeds reserved block",
                self.id,
                n_entries
            );
            return Err(FtlError::MetaOverflow);
        }
        Ok(pgs as u16)
    }

    /// Load a persisted table from a reserved block. `None` means the block
    /// is virgin (caller creates and flushes a fresh table); the block is
    /// erased in that case so the next flush starts at page 0.
    pub fn meta_load(
        &self,
        blk: u16,
        entry_sz: usize,
        n_entries: usize,
    ) -> Result<Option<Vec<u8>>, FtlError> {
        let md_pgs = self.meta_pgs(entry_sz, n_entries)?;
        let pg = self.newest_meta_page(blk, md_pgs)?;
        if pg == 0 {
            self.rsv_erase(blk)?;
            return Ok(None);
        }

        let per_pg = self.meta_ent_per_pg(entry_sz);
        let per_pl = per_pg / self.geo.n_of_planes as usize;
        let mut table = vec![0u8; entry_sz * n_entries];
        let start = pg - md_pgs;
        let mut left = n_entries;

        for i in 0..md_pgs {
            let bufs = self.rsv_read(blk, start + i)?;
            for (pl, buf) in bufs.iter().enumerate() {
                if left == 0 {
                    break;
                }
                let take = left.min(per_pl);
                let off = (i as usize * per_pg + pl * per_pl) * entry_sz;
                table[off..off + take * entry_sz].copy_from_slice(&buf[..take * entry_sz]);
                left -= take;
            }
        }
        Ok(Some(table))
    }

    /// Flush a table to a reserved block at the next free page-walk slot,
    /// stamping `header` (magic first) into plane-0 OOB of every page.
    pub fn meta_flush(
        &self,
        blk: u16,
        entry_sz: usize,
        table: &[u8],
        header: &[u8],
    ) -> Result<(), FtlError> {
        let n_entries = table.len() / entry_sz;
        let md_pgs = self.meta_pgs(entry_sz, n_entries)?;
        let mut pg = self.newest_meta_page(blk, md_pgs)?;
        if pg > self.geo.pg_per_blk - md_pgs {
            self.rsv_erase(blk)?;
            pg = 0;
        }

        let per_pg = self.meta_ent_per_pg(entry_sz);
        let per_pl = per_pg / self.geo.n_of_planes as usize;
        let buf_sz = (self.geo.pg_size + self.geo.pg_oob_sz()) as usize;
        let mut left = n_entries;

        for i in 0..md_pgs {
            let mut bufs = Vec::with_capacity(self.geo.n_of_planes as usize);
            for pl in 0..self.geo.n_of_planes as usize {
                let mut buf = vec![0u8; buf_sz];
                if left > 0 {
                    let take = left.min(per_pl);
                    let off = (i as usize * per_pg + pl * per_pl) * entry_sz;
                    buf[..take * entry_sz].copy_from_slice(&table[off..off + take * entry_sz]);
                    left -= take;
                }
                if pl == 0 {
                    buf[self.geo.pg_size as usize..self.geo.pg_size as usize + header.len()]
                        .copy_from_slice(header);
                }
                bufs.push(buf);
            }
            self.rsv_write(blk, pg + i, bufs)?;
        }
        Ok(())
    }
}

/// The FTL instance: all channels plus the global components.
pub struct AppFtl {
    pub cfg: FtlConfig,
    pub mm: Arc<dyn MediaManager>,
    pub sync: Arc<SyncIo>,
    pub channels: Vec<Arc<FtlChannel>>,
    pub gl_prov: GlProv,
    pub gl_map: GlMap,
    pub lba_io: LbaIo,
    pub gc: Gc,
    pub page_io: PageIo,
    pub hosts: Mutex<Pool<HostCmd>>,
    /// Serializes GC namespace upserts against host upserts.
    pub ns_mutex: Mutex<()>,
    /// Host commands finished by the FTL, drained by the controller.
    pub completed: Mutex<VecDeque<CmdId>>,
    pub cap: FtlCap,
}

impl AppFtl {
    pub fn new(
        cfg: FtlConfig,
        mm: Arc<dyn MediaManager>,
        sync: Arc<SyncIo>,
        channels: Vec<Arc<FtlChannel>>,
    ) -> Result<Self, FtlError> {
        let gl_map = GlMap::init(&cfg, &channels)?;
        let lba_io = LbaIo::new(&cfg, &channels)?;
        let hosts = Mutex::new(Pool::new(cfg.queue_size * cfg.nq));
        let ftl = Self {
            gl_prov: GlProv::new(),
            gl_map,
            lba_io,
            gc: Gc::new(&cfg),
            page_io: PageIo::new(&cfg),
            hosts,
            ns_mutex: Mutex::new(()),
            completed: Mutex::new(VecDeque::new()),
            cap: FtlCap::GET_BBTBL | FtlCap::SET_BBTBL | FtlCap::INIT_FN | FtlCap::EXIT_FN,
            cfg,
            mm,
            sync,
            channels,
        };
        log::info!("[ftl] application FTL started ({} channels)", ftl.channels.len());
        Ok(ftl)
    }

    pub fn nch(&self) -> usize {
        self.channels.len()
    }

    /// FTL submission-side entry: route one host command.
    pub fn submit_io(&self, id: CmdId, now_us: u64) -> Result<(), FtlError> {
        let kind = {
            let hosts = self.hosts.lock();
            hosts.get(id).ok_or(FtlError::OutOfBounds)?.kind
        };
        if kind.is_phys() {
            self.page_io.submit_phys(self, id)
        } else {
            self.lba_io.submit(self, id, now_us)
        }
    }

    /// Drain media completions (direct and those surfaced by sync pumping)
    /// into the page-I/O completion path.
    pub fn process_media(&self) {
        loop {
            let cmd = self.sync.inbox().lock().pop_front();
            match cmd {
                Some(c) => self.page_io.complete(self, c),
                None => break,
            }
        }
        let mut pending = Vec::new();
        self.mm.process(usize::MAX, &mut |mut cmd: MediaIoCmd| {
            if let Some(group) = cmd.sync.take() {
                group.complete(cmd);
            } else {
                pending.push(cmd);
            }
        });
        for cmd in pending {
            self.page_io.complete(self, cmd);
        }
    }

    /// Mark a host command finished; the controller completes it upstream.
    pub(crate) fn finish_host(&self, id: CmdId) {
        self.completed.lock().push_back(id);
    }

    /// Copy of one LUN's bad-block row.
    pub fn get_bbtbl(&self, ppa: Ppa, nblk: usize) -> Result<Vec<u8>, FtlError> {
        let ch = self
            .channels
            .get(ppa.ch() as usize)
            .ok_or(FtlError::OutOfBounds)?;
        let n_pl = ch.geo.n_of_planes as usize;
        if nblk != ch.geo.blk_per_lun as usize * n_pl {
            return Err(FtlError::OutOfBounds);
        }
        let bbt = ch.bbt.lock();
        Ok(bbt.lun_row(ppa.lun()).to_vec())
    }

    /// Mark one (block, plane) and flush the table if the value changed.
    pub fn set_bbtbl(&self, ppa: Ppa, value: u8) -> Result<(), FtlError> {
        let ch = self
            .channels
            .get(ppa.ch() as usize)
            .ok_or(FtlError::OutOfBounds)?;
        let changed = {
            let mut bbt = ch.bbt.lock();
            bbt.mark(&ch.geo, ppa, value)?
        };
        if changed && bbt::flush(ch).is_err() {
            log::warn!("[ftl] ch {}: bad block table flush failed", ch.id);
        }
        Ok(())
    }

    /// Persist everything that must survive: dirty map pages, map
    /// directories and block metadata (with bounded retry).
    pub fn exit(&self) -> Result<(), FtlError> {
        self.gl_map.exit_flush(self)?;
        for ch in &self.channels {
            ch_map::flush(ch)?;
            let mut retry = 0;
            loop {
                match blk_md::flush(ch) {
                    Ok(()) => break,
                    Err(e) if retry + 1 < self.cfg.flush_retry => {
                        retry += 1;
                        log::warn!("[ftl] ch {}: block metadata flush retry: {}", ch.id, e);
                    }
                    Err(e) => {
                        log::error!("[ftl] ch {}: block metadata not persisted: {}", ch.id, e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}
