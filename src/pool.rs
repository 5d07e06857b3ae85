//! Kind worker pool
//!
//! Bounded multi-consumer fan-out of per-row work across kinds: one consumer
//! thread per kind, one bounded free list of pooled envelopes. A producer
//! allocates an envelope (blocking when none is free), fills its task slot,
//! and publishes it to every consumer with a consumers-remaining count; each
//! consumer processes only its own kind's slice, and the last one to finish
//! recycles the envelope onto the free list. Nothing allocates in steady
//! state beyond channel plumbing: the task buffers (and their field vectors)
//! are reused across rows.
//!
//! Ordering: each per-kind channel is FIFO, so a later row's work for a kind
//! never starts in that kind until the earlier row's work there completed.
//! Kinds proceed concurrently; their mixtures are disjoint.
//!
//! `producer_wait` blocks until every published envelope has been fully
//! consumed; it is the barrier behind `process_batch`, kind-set mutation, and
//! pool resizing. Shrinking retires consumers by hanging up their channels;
//! growth spawns consumers seeded by the caller-supplied factory.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::schema::ProductValue;

/// What a published row asks each kind to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskAction {
    Add,
    Remove,
}

/// One row's fan-out payload: the full value plus one partial per kind.
#[derive(Clone, Debug)]
pub struct TaskBuf {
    pub action: TaskAction,
    pub full_value: ProductValue,
    pub partial_values: Vec<ProductValue>,
}

impl Default for TaskBuf {
    fn default() -> Self {
        TaskBuf {
            action: TaskAction::Add,
            full_value: ProductValue::unobserved(),
            partial_values: Vec::new(),
        }
    }
}

/// A pooled envelope: a task slot plus the consumers-remaining count.
pub struct Envelope {
    task: RwLock<TaskBuf>,
    remaining: AtomicUsize,
}

impl Envelope {
    fn new() -> Self {
        Envelope {
            task: RwLock::new(TaskBuf::default()),
            remaining: AtomicUsize::new(0),
        }
    }
}

/// Count of published-but-unfinished envelopes, with a drained signal.
struct Inflight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Inflight {
    fn new() -> Self {
        Inflight {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn inc(&self) {
        *self.count.lock().expect("inflight lock") += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock().expect("inflight lock");
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().expect("inflight lock");
        while *count > 0 {
            count = self.drained.wait(count).expect("inflight lock");
        }
    }
}

struct WorkerHandle {
    tx: Sender<Arc<Envelope>>,
    join: JoinHandle<()>,
}

/// The per-kind consumer pool.
pub struct KindPool {
    capacity: usize,
    free_tx: Sender<Arc<Envelope>>,
    free_rx: Receiver<Arc<Envelope>>,
    workers: Vec<WorkerHandle>,
    inflight: Arc<Inflight>,
}

impl KindPool {
    /// A pool with `capacity` pooled envelopes and no consumers yet.
    ///
    /// `capacity == 0` builds an inert pool: inference runs inline and never
    /// publishes envelopes.
    pub fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = bounded(capacity.max(1));
        for _ in 0..capacity {
            free_tx.send(Arc::new(Envelope::new())).expect("free list capacity");
        }
        KindPool {
            capacity,
            free_tx,
            free_rx,
            workers: Vec::new(),
            inflight: Arc::new(Inflight::new()),
        }
    }

    /// Number of live consumers.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Take a free envelope, blocking while all are in flight, and fill its
    /// task slot through `fill`.
    pub fn producer_alloc(&self, fill: impl FnOnce(&mut TaskBuf)) -> Arc<Envelope> {
        assert!(self.capacity > 0, "pool is inert");
        let envelope = self.free_rx.recv().expect("free list hung up");
        {
            let mut task = envelope.task.write().expect("envelope lock");
            fill(&mut task);
        }
        envelope
    }

    /// Publish an envelope to every consumer with the given fan-out count.
    pub fn producer_send(&self, envelope: Arc<Envelope>, fanout: usize) {
        assert_eq!(fanout, self.workers.len(), "fan-out must cover every consumer");
        envelope.remaining.store(fanout, Ordering::Release);
        self.inflight.inc();
        for worker in &self.workers {
            worker.tx.send(envelope.clone()).expect("consumer hung up");
        }
    }

    /// Block until every published envelope has been fully consumed.
    pub fn producer_wait(&self) {
        self.inflight.wait();
    }

    /// Resize to `target` consumers. Must be called with no work in flight;
    /// shrinkage hangs up and joins retired consumers, growth spawns new
    /// ones from `spawn(kindid) -> handler`.
    pub fn resize<F>(&mut self, target: usize, mut spawn: F)
    where
        F: FnMut(usize) -> Box<dyn FnMut(&TaskBuf) + Send>,
    {
        self.producer_wait();
        while self.workers.len() > target {
            let worker = self.workers.pop().expect("nonempty");
            drop(worker.tx);
            worker.join.join().expect("consumer panicked");
        }
        while self.workers.len() < target {
            let kindid = self.workers.len();
            let mut handler = spawn(kindid);
            let (tx, rx) = bounded::<Arc<Envelope>>(self.capacity.max(1));
            let free_tx = self.free_tx.clone();
            let inflight = self.inflight.clone();
            let join = std::thread::spawn(move || {
                for envelope in rx.iter() {
                    {
                        let task = envelope.task.read().expect("envelope lock");
                        handler(&task);
                    }
                    if envelope.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        // Last consumer recycles the envelope.
                        free_tx.send(envelope).expect("free list hung up");
                        inflight.dec();
                    }
                }
            });
            self.workers.push(WorkerHandle { tx, join });
        }
    }

    /// Hang up every consumer and join them.
    pub fn shutdown(&mut self) {
        self.resize(0, |_| unreachable!("shutdown never spawns"));
    }
}

impl Drop for KindPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_pool(kinds: usize, capacity: usize) -> (KindPool, Vec<Arc<Mutex<Vec<u64>>>>) {
        let logs: Vec<Arc<Mutex<Vec<u64>>>> =
            (0..kinds).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let mut pool = KindPool::new(capacity);
        let spawn_logs = logs.clone();
        pool.resize(kinds, |kindid| {
            let log = spawn_logs[kindid].clone();
            Box::new(move |task: &TaskBuf| {
                let tag = task.full_value.counts[0] as u64;
                log.lock().unwrap().push(tag);
            })
        });
        (pool, logs)
    }

    fn publish(pool: &KindPool, tag: u32, kinds: usize) {
        let envelope = pool.producer_alloc(|task| {
            task.action = TaskAction::Add;
            task.full_value.reset(crate::schema::Sparsity::All);
            task.full_value.counts.push(tag);
            task.partial_values.clear();
        });
        pool.producer_send(envelope, kinds);
    }

    #[test]
    fn every_consumer_sees_every_row_in_publication_order() {
        let (pool, logs) = counting_pool(3, 2);
        for tag in 0..20 {
            publish(&pool, tag, 3);
        }
        pool.producer_wait();
        for log in &logs {
            let seen = log.lock().unwrap().clone();
            assert_eq!(seen, (0..20).collect::<Vec<u64>>());
        }
    }

    #[test]
    fn envelopes_are_recycled_through_the_free_list() {
        // Far more rows than envelopes: allocation must keep succeeding.
        let (pool, logs) = counting_pool(2, 2);
        for tag in 0..100 {
            publish(&pool, tag, 2);
        }
        pool.producer_wait();
        assert_eq!(logs[0].lock().unwrap().len(), 100);
        assert_eq!(logs[1].lock().unwrap().len(), 100);
    }

    #[test]
    fn producer_wait_is_a_barrier() {
        let (pool, logs) = counting_pool(2, 4);
        for tag in 0..10 {
            publish(&pool, tag, 2);
        }
        pool.producer_wait();
        // After the barrier, nothing is in flight: both logs are complete.
        assert_eq!(logs[0].lock().unwrap().len(), 10);
        assert_eq!(logs[1].lock().unwrap().len(), 10);
    }

    #[test]
    fn resize_shrinks_and_grows_between_barriers() {
        let (mut pool, logs) = counting_pool(3, 2);
        publish(&pool, 1, 3);
        pool.producer_wait();

        let more_logs: Vec<Arc<Mutex<Vec<u64>>>> =
            (0..4).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let spawn_logs = more_logs.clone();
        pool.resize(4, |kindid| {
            let log = spawn_logs[kindid].clone();
            Box::new(move |task: &TaskBuf| {
                log.lock().unwrap().push(task.full_value.counts[0] as u64);
            })
        });
        assert_eq!(pool.worker_count(), 4);

        publish(&pool, 2, 4);
        pool.producer_wait();
        // Original consumers survive growth and keep consuming; only the
        // new slot runs the new handler.
        assert_eq!(logs[0].lock().unwrap().as_slice(), &[1, 2]);
        assert_eq!(more_logs[3].lock().unwrap().as_slice(), &[2]);

        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);
    }
}
