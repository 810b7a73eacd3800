/// Multi-queue dispatch framework.
///
/// N bounded submission/completion queue pairs per owner. A producer calls
/// `submit`, the owner pumps `process_sq` to consume, acknowledges with
/// `complete`, and pumps `process_cq` to deliver completions. Within one
/// queue everything is FIFO.
///
/// A timeout sweep (`sweep`) detects requests stuck in the wait state. Each
/// timed-out slot is replaced by a freshly allocated "extended" entry so the
/// submission side never starves, and a late acknowledgment against a
/// timed-out slot is recorded without re-delivering the completion.
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MqFlags: u8 {
        /// Synthesize a completion for timed-out requests.
        const TO_COMPLETE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqEntryStatus {
    Free,
    Queued,
    Waiting,
    Timeout,
    TimeoutCompleted,
    /// Timed out, then acknowledged late.
    TimeoutBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqError {
    Full,
    BadQueue,
    BadTicket,
}

impl fmt::Display for MqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqError::Full => write!(f, "queue full"),
            MqError::BadQueue => write!(f, "queue id out of range"),
            MqError::BadTicket => write!(f, "ticket does not name a waiting entry"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqConfig {
    pub name: &'static str,
    pub n_queues: usize,
    pub q_size: usize,
    pub to_usec: u64,
    pub flags: MqFlags,
}

/// Names a submission entry handed to the SQ consumer; required to complete.
#[derive(Debug, Clone, Copy)]
pub struct MqTicket {
    pub qid: u16,
    slot: u32,
}

struct MqEntry<T> {
    opaque: Option<T>,
    status: MqEntryStatus,
    wtime_us: u64,
    is_ext: bool,
}

impl<T> MqEntry<T> {
    fn free() -> Self {
        Self {
            opaque: None,
            status: MqEntryStatus::Free,
            wtime_us: 0,
            is_ext: false,
        }
    }
}

struct MqQueue<T> {
    sq_entries: Vec<MqEntry<T>>,
    sq_free: VecDeque<u32>,
    sq_used: VecDeque<u32>,
    sq_wait: Vec<u32>,
    cq_free: VecDeque<u32>,
    cq_used: VecDeque<u32>,
    cq_entries: Vec<Option<T>>,
}

impl<T: Copy> MqQueue<T> {
    fn new(size: usize) -> Self {
        let mut sq_entries = Vec::with_capacity(size);
        let mut cq_entries = Vec::with_capacity(size);
        let mut sq_free = VecDeque::with_capacity(size);
        let mut cq_free = VecDeque::with_capacity(size);
        for i in 0..size {
            sq_entries.push(MqEntry::free());
            cq_entries.push(None);
            sq_free.push_back(i as u32);
            cq_free.push_back(i as u32);
        }
        Self {
            sq_entries,
            sq_free,
            sq_used: VecDeque::new(),
            sq_wait: Vec::new(),
            cq_free,
            cq_used: VecDeque::new(),
            cq_entries,
        }
    }
}

/// Per-queue counters, for the stats dump and for tests.
#[derive(Default)]
pub struct MqStats {
    pub ext_entries: AtomicU32,
    pub timeouts: AtomicU32,
    pub to_back: AtomicU32,
}

pub struct MultiQueue<T> {
    cfg: MqConfig,
    queues: Vec<Mutex<MqQueue<T>>>,
    stats: Vec<MqStats>,
}

impl<T: Copy> MultiQueue<T> {
    pub fn new(cfg: MqConfig) -> Result<Self, MqError> {
        if cfg.n_queues == 0 || cfg.q_size == 0 {
            return Err(MqError::BadQueue);
        }
        let mut queues = Vec::with_capacity(cfg.n_queues);
        let mut stats = Vec::with_capacity(cfg.n_queues);
        for _ in 0..cfg.n_queues {
            queues.push(Mutex::new(MqQueue::new(cfg.q_size)));
            stats.push(MqStats::default());
        }
        log::info!(
            "[mq] {}: started (nq {}, qs {})",
            cfg.name,
            cfg.n_queues,
            cfg.q_size
        );
        Ok(Self { cfg, queues, stats })
    }

    pub fn n_queues(&self) -> usize {
        self.cfg.n_queues
    }

    /// Enqueue an opaque item. Fails with `Full` when no submission slot is
    /// free; the producer decides whether to retry.
    pub fn submit(&self, qid: usize, opaque: T, now_us: u64) -> Result<(), MqError> {
        let q = self.queues.get(qid).ok_or(MqError::BadQueue)?;
        let mut q = q.lock();
        let slot = q.sq_free.pop_front().ok_or(MqError::Full)?;
        {
            let ent = &mut q.sq_entries[slot as usize];
            ent.opaque = Some(opaque);
            ent.status = MqEntryStatus::Queued;
            ent.wtime_us = now_us;
        }
        q.sq_used.push_back(slot);
        Ok(())
    }

    /// Pump the submission side: move up to `max` queued entries into the
    /// wait state and hand them to the consumer, FIFO.
    pub fn process_sq(&self, qid: usize, max: usize, sq_fn: &mut dyn FnMut(T, MqTicket)) -> usize {
        let mut n = 0;
        while n < max {
            let (opaque, ticket) = {
                let mut q = self.queues[qid].lock();
                let slot = match q.sq_used.pop_front() {
                    Some(s) => s,
                    None => break,
                };
                q.sq_entries[slot as usize].status = MqEntryStatus::Waiting;
                q.sq_wait.push(slot);
                (
                    q.sq_entries[slot as usize].opaque.unwrap(),
                    MqTicket {
                        qid: qid as u16,
                        slot,
                    },
                )
            };
            sq_fn(opaque, ticket);
            n += 1;
        }
        n
    }

    /// Acknowledge a consumed entry: the submission slot returns to the free
    /// list and the opaque moves onto the completion queue.
    ///
    /// An acknowledgment against a timed-out slot is marked `TimeoutBack` and
    /// is not delivered to the CQ consumer again.
    pub fn complete(&self, ticket: MqTicket) -> Result<(), MqError> {
        let q = self
            .queues
            .get(ticket.qid as usize)
            .ok_or(MqError::BadQueue)?;
        let mut q = q.lock();
        let slot = ticket.slot as usize;
        if slot >= q.sq_entries.len() {
            return Err(MqError::BadTicket);
        }
        match q.sq_entries[slot].status {
            MqEntryStatus::Waiting => {}
            MqEntryStatus::Timeout | MqEntryStatus::TimeoutCompleted => {
                q.sq_entries[slot].status = MqEntryStatus::TimeoutBack;
                q.sq_entries[slot].opaque = None;
                self.stats[ticket.qid as usize]
                    .to_back
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            _ => return Err(MqError::BadTicket),
        }

        let cq_slot = match q.cq_free.pop_front() {
            Some(s) => s,
            None => {
                // Last resort; sized to never happen under correct accounting.
                log::warn!("[mq] {}: CQ full, request not completed", self.cfg.name);
                return Err(MqError::Full);
            }
        };

        let opaque = q.sq_entries[slot].opaque.take().unwrap();
        if let Some(at) = q.sq_wait.iter().position(|&w| w == ticket.slot) {
            q.sq_wait.swap_remove(at);
        }
        q.sq_entries[slot] = MqEntry::free();
        q.sq_free.push_back(ticket.slot);

        q.cq_entries[cq_slot as usize] = Some(opaque);
        q.cq_used.push_back(cq_slot);
        Ok(())
    }

    /// Pump the completion side.
    pub fn process_cq(&self, qid: usize, max: usize, cq_fn: &mut dyn FnMut(T)) -> usize {
        let mut n = 0;
        while n < max {
            let opaque = {
                let mut q = self.queues[qid].lock();
                let slot = match q.cq_used.pop_front() {
                    Some(s) => s,
                    None => break,
                };
                let opaque = q.cq_entries[slot as usize].take().unwrap();
                q.cq_free.push_back(slot);
                opaque
            };
            cq_fn(opaque);
            n += 1;
        }
        n
    }

    /// Entries submitted but not yet consumed. The LBA scheduler uses this
    /// to decide whether more sectors are about to arrive.
    pub fn used_count(&self, qid: usize) -> usize {
        self.queues[qid].lock().sq_used.len()
    }

    /// Sweep every queue for entries waiting longer than the configured
    /// timeout. Timed-out opaques are reported in one batch to `to_fn`; with
    /// `TO_COMPLETE` they are also pushed through the completion queue. Each
    /// timed-out slot is replaced by an extended entry.
    pub fn sweep(&self, now_us: u64, to_fn: &mut dyn FnMut(&[T])) -> usize {
        let mut timed_out = Vec::new();
        for qid in 0..self.cfg.n_queues {
            let mut q = self.queues[qid].lock();
            let mut i = 0;
            while i < q.sq_wait.len() {
                let slot = q.sq_wait[i] as usize;
                if now_us.saturating_sub(q.sq_entries[slot].wtime_us) < self.cfg.to_usec {
                    i += 1;
                    continue;
                }
                q.sq_wait.swap_remove(i);
                let opaque = q.sq_entries[slot].opaque.unwrap();
                self.stats[qid].timeouts.fetch_add(1, Ordering::Relaxed);

                if self.cfg.flags.contains(MqFlags::TO_COMPLETE) {
                    q.sq_entries[slot].status = MqEntryStatus::TimeoutCompleted;
                    if let Some(cq_slot) = q.cq_free.pop_front() {
                        q.cq_entries[cq_slot as usize] = Some(opaque);
                        q.cq_used.push_back(cq_slot);
                    }
                } else {
                    q.sq_entries[slot].status = MqEntryStatus::Timeout;
                }

                // Replace the lost slot so the free list keeps its depth.
                q.sq_entries.push(MqEntry::free());
                let ext = (q.sq_entries.len() - 1) as u32;
                q.sq_entries[ext as usize].is_ext = true;
                q.sq_free.push_back(ext);
                self.stats[qid].ext_entries.fetch_add(1, Ordering::Relaxed);

                timed_out.push(opaque);
            }
        }
        if !timed_out.is_empty() {
            log::warn!(
                "[mq] {}: {} request(s) timed out",
                self.cfg.name,
                timed_out.len()
            );
            to_fn(&timed_out);
        }
        timed_out.len()
    }

    pub fn stats(&self, qid: usize) -> &MqStats {
        &self.stats[qid]
    }

    pub fn log_stats(&self) {
        for qid in 0..self.cfg.n_queues {
            let q = self.queues[qid].lock();
            log::info!(
                "[mq] {} q{}: SF {} SU {} SW {} CF {} CU {}",
                self.cfg.name,
                qid,
                q.sq_free.len(),
                q.sq_used.len(),
                q.sq_wait.len(),
                q.cq_free.len(),
                q.cq_used.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(flags: MqFlags) -> MqConfig {
        MqConfig {
            name: "test",
            n_queues: 2,
            q_size: 4,
            to_usec: 1000,
            flags,
        }
    }

    #[test]
    fn submit_consume_complete_fifo() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::empty())).unwrap();
        for v in 0..3 {
            mq.submit(0, v, 0).unwrap();
        }

        let mut seen = Vec::new();
        let mut tickets = Vec::new();
        mq.process_sq(0, usize::MAX, &mut |v, t| {
            seen.push(v);
            tickets.push(t);
        });
        assert_eq!(seen, [0, 1, 2]);

        for t in tickets {
            mq.complete(t).unwrap();
        }
        let mut done = Vec::new();
        mq.process_cq(0, usize::MAX, &mut |v| done.push(v));
        assert_eq!(done, [0, 1, 2]);
    }

    #[test]
    fn submit_backpressure() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::empty())).unwrap();
        for v in 0..4 {
            mq.submit(0, v, 0).unwrap();
        }
        assert_eq!(mq.submit(0, 99, 0), Err(MqError::Full));

        // Consuming alone does not free slots; completing does.
        let mut tickets = Vec::new();
        mq.process_sq(0, usize::MAX, &mut |_, t| tickets.push(t));
        assert_eq!(mq.submit(0, 99, 0), Err(MqError::Full));
        mq.complete(tickets[0]).unwrap();
        assert!(mq.submit(0, 99, 0).is_ok());
    }

    #[test]
    fn queues_are_independent() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::empty())).unwrap();
        mq.submit(0, 1, 0).unwrap();
        mq.submit(1, 2, 0).unwrap();
        assert_eq!(mq.used_count(0), 1);
        assert_eq!(mq.used_count(1), 1);
        let mut got = Vec::new();
        mq.process_sq(1, usize::MAX, &mut |v, _| got.push(v));
        assert_eq!(got, [2]);
        assert_eq!(mq.used_count(0), 1);
    }

    #[test]
    fn sweep_reports_stale_waiters() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::empty())).unwrap();
        mq.submit(0, 7, 0).unwrap();
        let mut tickets = Vec::new();
        mq.process_sq(0, usize::MAX, &mut |_, t| tickets.push(t));

        // Not stale yet.
        let mut batch = Vec::new();
        assert_eq!(mq.sweep(500, &mut |b| batch.extend_from_slice(b)), 0);

        assert_eq!(mq.sweep(2000, &mut |b| batch.extend_from_slice(b)), 1);
        assert_eq!(batch, [7]);
        // No synthesized completion without TO_COMPLETE.
        let mut done = Vec::new();
        mq.process_cq(0, usize::MAX, &mut |v| done.push(v));
        assert!(done.is_empty());
    }

    #[test]
    fn timeout_slot_is_replaced_by_extended_entry() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::empty())).unwrap();
        for v in 0..4 {
            mq.submit(0, v, 0).unwrap();
        }
        mq.process_sq(0, usize::MAX, &mut |_, _| {});
        mq.sweep(2000, &mut |_| {});
        assert_eq!(mq.stats(0).ext_entries.load(Ordering::Relaxed), 4);

        // Full depth available again even though nothing completed.
        for v in 0..4 {
            mq.submit(0, 10 + v, 0).unwrap();
        }
    }

    #[test]
    fn to_complete_synthesizes_completion() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::TO_COMPLETE)).unwrap();
        mq.submit(0, 9, 0).unwrap();
        mq.process_sq(0, usize::MAX, &mut |_, _| {});
        mq.sweep(2000, &mut |_| {});

        let mut done = Vec::new();
        mq.process_cq(0, usize::MAX, &mut |v| done.push(v));
        assert_eq!(done, [9]);
    }

    #[test]
    fn late_completion_is_timeout_back() {
        let mq: MultiQueue<u32> = MultiQueue::new(cfg(MqFlags::TO_COMPLETE)).unwrap();
        mq.submit(0, 9, 0).unwrap();
        let mut tickets = Vec::new();
        mq.process_sq(0, usize::MAX, &mut |_, t| tickets.push(t));
        mq.sweep(2000, &mut |_| {});

        // Drain the synthesized completion first.
        let mut done = Vec::new();
        mq.process_cq(0, usize::MAX, &mut |v| done.push(v));
        assert_eq!(done, [9]);

        // The late ack must not re-deliver.
        mq.complete(tickets[0]).unwrap();
        let mut again = Vec::new();
        mq.process_cq(0, usize::MAX, &mut |v| again.push(v));
        assert!(again.is_empty());
        assert_eq!(mq.stats(0).to_back.load(Ordering::Relaxed), 1);
    }
}
