//! Static-split thread pool.
//!
//! Kernels are data-parallel over a `(n_threads, thread_idx)` contract: each
//! index owns the range returned by [`split_range`] and the pool joins at a
//! barrier before the next op is dispatched. Threads are spawned once at
//! driver construction and reused for every kernel.

use std::marker::PhantomData;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;

/// Work-split contract shared by the codecs and kernels: `[base*idx,
/// base*(idx+1))` with `base = n / n_threads`, and the final thread absorbs
/// the remainder.
#[inline]
pub fn split_range(n: usize, n_threads: usize, idx: usize) -> (usize, usize) {
    debug_assert!(idx < n_threads);
    let base = n / n_threads;
    let start = base * idx;
    let end = if idx == n_threads - 1 { n } else { start + base };
    (start, end)
}

/// Type-erased pointer to the task currently being fanned out.
struct TaskPtr(*const (dyn Fn(usize, usize) + Sync));

// The pointee is Sync and `run` blocks until every worker has signalled
// completion, so the pointer never outlives the borrow it was made from.
unsafe impl Send for TaskPtr {}

enum Job {
    Run(TaskPtr),
    Shutdown,
}

/// Fixed pool of `n_threads - 1` spawned workers; the dispatching thread
/// itself executes the final index (the one that absorbs `n % n_threads`).
pub struct ThreadPool {
    n_threads: usize,
    job_txs: Vec<Sender<Job>>,
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(n_threads: usize) -> Self {
        assert!(n_threads > 0);
        let (done_tx, done_rx) = channel();
        let mut job_txs = Vec::with_capacity(n_threads - 1);
        let mut handles = Vec::with_capacity(n_threads - 1);

        for idx in 0..n_threads - 1 {
            let (job_tx, job_rx) = channel::<Job>();
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("meshlm-pool-{idx}"))
                .spawn(move || loop {
                    match job_rx.recv() {
                        Ok(Job::Run(task)) => {
                            let f = unsafe { &*task.0 };
                            f(n_threads, idx);
                            if done_tx.send(()).is_err() {
                                break;
                            }
                        }
                        Ok(Job::Shutdown) | Err(_) => break,
                    }
                })
                .expect("spawn pool thread");
            job_txs.push(job_tx);
            handles.push(handle);
        }

        Self {
            n_threads,
            job_txs,
            done_rx,
            handles,
        }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Run `f(n_threads, idx)` for every index and block until all are done.
    pub fn run<F>(&self, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        let task: &(dyn Fn(usize, usize) + Sync) = &f;
        // SAFETY: `run` blocks until every pool thread has finished with
        // `task` (via `done_rx.recv()` below) before returning, so the
        // extended lifetime never actually outlives `f`.
        let task: &'static (dyn Fn(usize, usize) + Sync) = unsafe { std::mem::transmute(task) };
        for tx in &self.job_txs {
            tx.send(Job::Run(TaskPtr(task))).expect("pool thread gone");
        }
        f(self.n_threads, self.n_threads - 1);
        for _ in &self.job_txs {
            self.done_rx.recv().expect("pool thread gone");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for tx in &self.job_txs {
            let _ = tx.send(Job::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Shared view of an output buffer that hands out `&mut` ranges to pool
/// threads. Callers must take disjoint ranges; the split contract guarantees
/// this when every thread writes only its `split_range` share.
pub struct ShardedMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<'a, T: Send> Send for ShardedMut<'a, T> {}
unsafe impl<'a, T: Send> Sync for ShardedMut<'a, T> {}

impl<'a, T> ShardedMut<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable access to `[start, end)`. Ranges handed to different threads
    /// must not overlap.
    #[allow(clippy::mut_from_ref)]
    pub fn range(&self, start: usize, end: usize) -> &mut [T] {
        assert!(start <= end && end <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), end - start) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn split_covers_range_exactly() {
        for n in [0usize, 1, 31, 32, 100] {
            for n_threads in [1usize, 2, 4, 8] {
                let mut covered = 0;
                let mut next = 0;
                for idx in 0..n_threads {
                    let (start, end) = split_range(n, n_threads, idx);
                    assert_eq!(start, next);
                    covered += end - start;
                    next = end;
                }
                assert_eq!(covered, n);
            }
        }
    }

    #[test]
    fn remainder_goes_to_last_thread() {
        let (start, end) = split_range(10, 4, 3);
        assert_eq!((start, end), (6, 10));
        let (start, end) = split_range(10, 4, 0);
        assert_eq!((start, end), (0, 2));
    }

    #[test]
    fn pool_runs_every_index() {
        let pool = ThreadPool::new(4);
        let hits = AtomicUsize::new(0);
        pool.run(|n_threads, idx| {
            assert_eq!(n_threads, 4);
            hits.fetch_add(1 << idx, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0b1111);
    }

    #[test]
    fn pool_writes_disjoint_ranges() {
        let pool = ThreadPool::new(3);
        let mut out = vec![0usize; 10];
        let view = ShardedMut::new(&mut out);
        pool.run(|n_threads, idx| {
            let (start, end) = split_range(view.len(), n_threads, idx);
            for (offset, v) in view.range(start, end).iter_mut().enumerate() {
                *v = start + offset;
            }
        });
        drop(view);
        let expect: Vec<usize> = (0..10).collect();
        assert_eq!(out, expect);
    }

    #[test]
    fn pool_is_reusable() {
        let pool = ThreadPool::new(2);
        for round in 0..5usize {
            let count = AtomicUsize::new(0);
            pool.run(|_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(count.load(Ordering::SeqCst), 2, "round {round}");
        }
    }
}
