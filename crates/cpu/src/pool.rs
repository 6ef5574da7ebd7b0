use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{available_parallelism, spawn, JoinHandle},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads draining a shared job queue.
///
/// Workers pick up jobs in FIFO order and run each to completion; jobs are
/// expected to poll [`TaskPool::canceled`] at their own batch boundaries.
pub struct TaskPool {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<State>,
    work_cond: Condvar,
    done_cond: Condvar,
    canceled: AtomicBool,
    stopped: AtomicBool,
}

struct State {
    queue: VecDeque<Job>,
    in_flight: usize,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::with_threads(available_parallelism().map(|x| x.get()).unwrap_or(1))
    }

    pub fn with_threads(threads: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                in_flight: 0,
            }),
            work_cond: Condvar::new(),
            done_cond: Condvar::new(),
            canceled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        Self {
            threads: (0..threads.max(1))
                .map(|_| {
                    let inner = inner.clone();
                    spawn(move || inner.worker())
                })
                .collect(),
            inner,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Enqueue one job. Jobs pushed after [`TaskPool::cancel`] returned run
    /// normally.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(Box::new(job));
        self.inner.work_cond.notify_one();
    }

    /// Block until the queue is empty and no job is running.
    pub fn wait_work(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !state.queue.is_empty() || state.in_flight > 0 {
            state = self.inner.done_cond.wait(state).unwrap();
        }
    }

    /// Signal cancellation, wait for the queue to drain, then clear the
    /// flag. Queued jobs still run; they observe [`TaskPool::canceled`] and
    /// are expected to exit early.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        self.wait_work();
        self.inner.canceled.store(false, Ordering::Release);
    }

    pub fn canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// A cheap handle jobs can poll for cancellation from worker threads.
    pub fn cancel_observer(&self) -> CancelObserver {
        CancelObserver(self.inner.clone())
    }

    /// Drain remaining jobs and join every worker. Called on drop.
    pub fn stop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.work_cond.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct CancelObserver(Arc<Inner>);

impl CancelObserver {
    pub fn canceled(&self) -> bool {
        self.0.canceled.load(Ordering::Acquire)
    }
}

impl Inner {
    fn worker(&self) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        state.in_flight += 1;
                        break job;
                    }
                    if self.stopped.load(Ordering::Acquire) {
                        return;
                    }
                    state = self.work_cond.wait(state).unwrap();
                }
            };

            job();

            let mut state = self.state.lock().unwrap();
            state.in_flight -= 1;
            if state.queue.is_empty() && state.in_flight == 0 {
                self.done_cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[test]
    fn runs_every_job() {
        let pool = TaskPool::with_threads(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 1..=1000usize {
            let counter = counter.clone();
            pool.push(move || {
                counter.fetch_add(i, Ordering::Relaxed);
            });
        }
        pool.wait_work();

        assert_eq!(counter.load(Ordering::Relaxed), 500500);
    }

    #[test]
    fn cancel_returns_promptly() {
        let pool = Arc::new(TaskPool::with_threads(2));
        for _ in 0..16 {
            let observer = pool.clone();
            pool.push(move || {
                if observer.canceled() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            });
        }

        let start = Instant::now();
        pool.cancel();
        pool.wait_work();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!pool.canceled());
    }
}
