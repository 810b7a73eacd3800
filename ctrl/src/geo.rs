/// Media geometry: the immutable layout a media manager exposes.
///
/// Eight parameters describe the hierarchy (channels → LUNs → blocks →
/// pages → planes → sectors); everything else is derived. A multi-plane
/// page addresses all planes at equal (ch, lun, blk, pg), which is the unit
/// the FTL provisions and the unit the mapping table is paged in.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub n_of_ch: u8,
    pub lun_per_ch: u8,
    pub blk_per_lun: u16,
    pub pg_per_blk: u16,
    pub sec_per_pg: u16,
    pub n_of_planes: u8,
    /// Single-plane page size in bytes.
    pub pg_size: u32,
    /// Out-of-band bytes per sector.
    pub sec_oob_sz: u32,
}

impl Geometry {
    /// Sector size in bytes.
    pub fn sec_size(&self) -> u32 {
        self.pg_size / self.sec_per_pg as u32
    }

    /// Sectors in a multi-plane page.
    pub fn sec_per_pl_pg(&self) -> u32 {
        self.sec_per_pg as u32 * self.n_of_planes as u32
    }

    /// Sectors in a multi-plane block.
    pub fn sec_per_blk(&self) -> u32 {
        self.sec_per_pl_pg() * self.pg_per_blk as u32
    }

    /// Multi-plane page size in bytes.
    pub fn pl_pg_size(&self) -> u32 {
        self.pg_size * self.n_of_planes as u32
    }

    /// OOB bytes of a single-plane page.
    pub fn pg_oob_sz(&self) -> u32 {
        self.sec_oob_sz * self.sec_per_pg as u32
    }

    /// OOB bytes of a multi-plane page.
    pub fn pl_pg_oob_sz(&self) -> u32 {
        self.pg_oob_sz() * self.n_of_planes as u32
    }

    /// Multi-plane blocks per channel.
    pub fn blk_per_ch(&self) -> u32 {
        self.blk_per_lun as u32 * self.lun_per_ch as u32
    }

    /// Sectors per channel.
    pub fn sec_per_ch(&self) -> u64 {
        self.sec_per_blk() as u64 * self.blk_per_ch() as u64
    }

    /// Bytes of a multi-plane block (data only).
    pub fn blk_size(&self) -> u64 {
        self.pl_pg_size() as u64 * self.pg_per_blk as u64
    }

    /// Per-plane page slots on the whole device (used by the emulator).
    pub fn total_plane_pages(&self) -> u64 {
        self.n_of_ch as u64
            * self.lun_per_ch as u64
            * self.blk_per_lun as u64
            * self.n_of_planes as u64
            * self.pg_per_blk as u64
    }

    /// Validity bitmap length in bytes for one multi-plane block.
    pub fn blk_state_bytes(&self) -> usize {
        let bits = self.sec_per_blk() as usize;
        (bits + 7) / 8
    }

    pub fn log_layout(&self) {
        log::info!(
            "[geo] {} ch x {} lun x {} blk x {} pg x {} pl, {} sec/pg",
            self.n_of_ch,
            self.lun_per_ch,
            self.blk_per_lun,
            self.pg_per_blk,
            self.n_of_planes,
            self.sec_per_pg
        );
        log::info!(
            "[geo] sector {} B, page {} B, plane-page {} B, block {} B, oob {} B/sec",
            self.sec_size(),
            self.pg_size,
            self.pl_pg_size(),
            self.blk_size(),
            self.sec_oob_sz
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            n_of_ch: 8,
            lun_per_ch: 4,
            blk_per_lun: 32,
            pg_per_blk: 128,
            sec_per_pg: 4,
            n_of_planes: 2,
            pg_size: 0x4000,
            sec_oob_sz: 256,
        }
    }

    #[test]
    fn derived_sizes() {
        let g = geo();
        assert_eq!(g.sec_size(), 0x1000);
        assert_eq!(g.sec_per_pl_pg(), 8);
        assert_eq!(g.sec_per_blk(), 1024);
        assert_eq!(g.pl_pg_size(), 0x8000);
        assert_eq!(g.pg_oob_sz(), 1024);
        assert_eq!(g.blk_per_ch(), 128);
    }

    #[test]
    fn state_bitmap_len() {
        let g = geo();
        // 1024 sectors per block -> 128 bytes of validity bits
        assert_eq!(g.blk_state_bytes(), 128);
    }
}
