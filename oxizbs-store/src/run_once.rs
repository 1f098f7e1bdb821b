//! Run-once task pool: fan work out to pre-spawned workers, or run inline
//! when all workers are busy.
//!
//! The page-cache client uses this to overlap page loads without spawning
//! a thread per read. A pool belongs to one owner thread: `submit` chains
//! tasks onto a [`TaskChain`] and `reap` joins the whole chain. Tasks run
//! at most once each; workers never queue more than one task.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

struct Worker {
    tx: Sender<(Job, Sender<()>)>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Pool of pre-spawned workers.
pub struct RunOncePool {
    workers: Vec<Worker>,
}

/// Completion handles of submitted tasks.
#[derive(Default)]
pub struct TaskChain {
    pending: Vec<Receiver<()>>,
}

impl RunOncePool {
    /// Spawn `n` workers.
    pub fn new(n: usize) -> Self {
        let workers = (0..n)
            .map(|i| {
                let (tx, rx) = bounded::<(Job, Sender<()>)>(1);
                let busy = Arc::new(AtomicBool::new(false));
                let busy2 = Arc::clone(&busy);
                let handle = std::thread::Builder::new()
                    .name(format!("oxizbs-runonce-{i}"))
                    .spawn(move || {
                        while let Ok((job, done)) = rx.recv() {
                            job();
                            busy2.store(false, Ordering::Release);
                            let _ = done.send(());
                        }
                    })
                    .expect("spawn run-once worker");
                Worker {
                    tx,
                    busy,
                    handle: Some(handle),
                }
            })
            .collect();
        Self { workers }
    }

    /// Run `f` on a free worker, else inline on the caller. Either way its
    /// completion joins the chain.
    pub fn submit(&self, chain: &mut TaskChain, f: impl FnOnce() + Send + 'static) {
        let mut job: Job = Box::new(f);
        for w in &self.workers {
            if w.busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let (done_tx, done_rx) = bounded(1);
                match w.tx.send((job, done_tx)) {
                    Ok(()) => {
                        chain.pending.push(done_rx);
                        return;
                    }
                    Err(e) => {
                        // Worker gone: fall through to inline.
                        job = e.into_inner().0;
                        w.busy.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        }
        job();
    }

    /// Wait for every task in the chain.
    pub fn reap(&self, chain: &mut TaskChain) {
        for rx in chain.pending.drain(..) {
            let _ = rx.recv();
        }
    }
}

impl Drop for RunOncePool {
    fn drop(&mut self) {
        for w in &mut self.workers {
            let (tx, _) = bounded(1);
            let _ = std::mem::replace(&mut w.tx, tx);
        }
        for w in &mut self.workers {
            if let Some(h) = w.handle.take() {
                let _ = h.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_all_tasks_run_exactly_once() {
        let pool = RunOncePool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut chain = TaskChain::default();
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            pool.submit(&mut chain, move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.reap(&mut chain);
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_zero_workers_runs_inline() {
        let pool = RunOncePool::new(0);
        let mut chain = TaskChain::default();
        let mut hit = false;
        let flag = Arc::new(AtomicBool::new(false));
        let f2 = Arc::clone(&flag);
        pool.submit(&mut chain, move || {
            f2.store(true, Ordering::Relaxed);
        });
        pool.reap(&mut chain);
        hit |= flag.load(Ordering::Relaxed);
        assert!(hit);
    }
}
