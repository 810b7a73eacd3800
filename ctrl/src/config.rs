/// Recognized FTL options, with the defaults the controller runs with.

#[derive(Debug, Clone)]
pub struct FtlConfig {
    /// Free-block ratio below which a channel is collected.
    pub gc_thresd: f32,
    /// Minimum invalid fraction a GC victim must exceed.
    pub gc_target_rate: f32,
    /// Upper bound on victims per GC pass.
    pub gc_max_blks: usize,
    /// Channels collected concurrently per pass.
    pub gc_parallel_ch: usize,
    /// Map cache pages per channel.
    pub map_buf_ch_pgs: usize,
    /// Map cache page buffer size in bytes.
    pub map_buf_pg_sz: usize,
    /// Concurrent host commands held by the LBA scheduler.
    pub lba_io_entries: usize,
    /// Metadata flush retries before giving up.
    pub flush_retry: usize,
    /// FTL submission/completion queue depth.
    pub queue_size: usize,
    /// FTL queues; writes use the lower half, reads the upper half.
    pub nq: usize,
    /// Host command timeout on the FTL queues.
    pub ftl_queue_to_us: u64,
    /// Sector timeout on the LBA scheduler queues.
    pub lba_queue_to_us: u64,
    /// How long a partial line waits for more sectors before flushing.
    pub lba_io_empty_us: u64,
    /// Media-manager polls before a synchronous I/O is declared timed out.
    pub sync_io_polls: u32,
    /// Submit/complete retries against a full queue.
    pub queue_retry: usize,
    /// Seed for the provisioner's free-list shuffle.
    pub prov_seed: u64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            gc_thresd: 0.2,
            gc_target_rate: 0.5,
            gc_max_blks: 64,
            gc_parallel_ch: 3,
            map_buf_ch_pgs: 10,
            map_buf_pg_sz: 32 * 1024,
            lba_io_entries: 64,
            flush_retry: 3,
            queue_size: 64,
            nq: 8,
            ftl_queue_to_us: 4_000_000,
            lba_queue_to_us: 2_000_000,
            lba_io_empty_us: 200,
            sync_io_polls: 64,
            queue_retry: 16,
            prov_seed: 0x6f78,
        }
    }
}
