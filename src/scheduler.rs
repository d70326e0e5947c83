//! The parallel task scheduler: a bounded pool of workers draining a
//! shared queue, plus the wait-group primitive used to join another
//! worker's in-progress target transition.
//!
//! Queued tasks are opportunistic: a task that loses the claim on its
//! target returns instead of blocking, so a worker only ever parks in a
//! counter wait whose owner is an actively running thread.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub type Job<'env> = Box<dyn for<'a> FnOnce(&'a Scheduler<'env>) + Send + 'env>;

struct State<'env> {
    queue: VecDeque<Job<'env>>,
    active: usize,
    shutdown: bool,
}

pub struct Scheduler<'env> {
    state: Mutex<State<'env>>,
    work_avail: Condvar,
    idle: Condvar,
    progress_lock: Mutex<()>,
    progress: Condvar,
    /// A worker died in a panic; waits re-raise instead of hanging on a
    /// counter that will never advance.
    panicked: AtomicBool,
    workers: usize,
    queue_cap: usize,
}

impl<'env> Scheduler<'env> {
    fn new(workers: usize) -> Self {
        Scheduler {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work_avail: Condvar::new(),
            idle: Condvar::new(),
            progress_lock: Mutex::new(()),
            progress: Condvar::new(),
            panicked: AtomicBool::new(false),
            workers,
            queue_cap: workers * 8,
        }
    }

    fn run_job(&self, job: Job<'env>) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| job(self))).is_err() {
            self.panicked.store(true, Ordering::Release);
        }
        self.task_done();
    }

    fn check_panicked(&self) {
        if self.panicked.load(Ordering::Acquire) {
            panic!("build aborted: a worker panicked");
        }
    }

    pub fn parallelism(&self) -> usize {
        self.workers
    }

    /// Queue a task.  Never blocks; tasks submitted from within recipes
    /// must not be throttled or a waiting worker could starve its own
    /// children.
    pub fn submit(&self, job: impl for<'a> FnOnce(&'a Scheduler<'env>) + Send + 'env) {
        let mut st = self.state.lock().unwrap();
        st.queue.push_back(Box::new(job));
        drop(st);
        self.work_avail.notify_one();
    }

    /// Queue a task from outside any target lock (the driver boundary).
    /// When the queue is over capacity the submitting thread steals
    /// queued work until there is space.
    pub fn submit_wait(&self, job: impl for<'a> FnOnce(&'a Scheduler<'env>) + Send + 'env) {
        loop {
            let mut st = self.state.lock().unwrap();
            if st.queue.len() < self.queue_cap || st.shutdown {
                st.queue.push_back(Box::new(job));
                drop(st);
                self.work_avail.notify_one();
                return;
            }
            if let Some(stolen) = st.queue.pop_front() {
                st.active += 1;
                drop(st);
                self.run_job(stolen);
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            let mut st = self.state.lock().unwrap();
            let job = loop {
                if let Some(j) = st.queue.pop_front() {
                    st.active += 1;
                    break j;
                }
                if st.shutdown {
                    return;
                }
                st = self.work_avail.wait(st).unwrap();
            };
            drop(st);
            self.run_job(job);
        }
    }

    fn task_done(&self) {
        let mut st = self.state.lock().unwrap();
        st.active -= 1;
        let idle = st.active == 0 && st.queue.is_empty();
        drop(st);
        if idle {
            self.idle.notify_all();
        }
        self.notify_progress();
    }

    /// Block until the queue is drained and no task is running.  Phase
    /// transitions happen behind this.
    pub fn wait_idle(&self) {
        loop {
            self.check_panicked();
            let st = self.state.lock().unwrap();
            if st.queue.is_empty() && st.active == 0 {
                return;
            }
            // The timeout covers the window between a worker's emptiness
            // check and this wait.
            let _ = self
                .idle
                .wait_timeout(st, Duration::from_millis(20))
                .unwrap();
        }
    }

    /// Wake threads blocked in `wait_count`.  Called after every counter
    /// publish.
    pub fn notify_progress(&self) {
        let _g = self.progress_lock.lock().unwrap();
        self.progress.notify_all();
    }

    /// The wait-group: block until the counter reaches `at_least`.
    pub fn wait_count(&self, counter: &AtomicUsize, at_least: usize) {
        self.wait_until(counter, |c| c >= at_least);
    }

    /// Block until the counter satisfies the predicate.  Counter values
    /// are not strictly monotonic (an unmatch reverts one), so lock
    /// waiters need a predicate rather than a threshold.
    pub fn wait_until(&self, counter: &AtomicUsize, pred: impl Fn(usize) -> bool) {
        loop {
            if pred(counter.load(Ordering::Acquire)) {
                return;
            }
            self.check_panicked();
            let g = self.progress_lock.lock().unwrap();
            if pred(counter.load(Ordering::Acquire)) {
                return;
            }
            let _ = self
                .progress
                .wait_timeout(g, Duration::from_millis(20))
                .unwrap();
        }
    }

    fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.work_avail.notify_all();
    }
}

/// Run `f` with a live scheduler.  Workers are scoped threads, so tasks
/// may borrow from the caller's environment; they are joined before this
/// returns.  A panic in `f` or in a worker shuts the pool down and
/// re-raises.
pub fn with_scheduler<'env, T>(
    workers: usize,
    f: impl FnOnce(&Scheduler<'env>) -> T,
) -> T {
    assert!(workers > 0);
    let sched = Scheduler::new(workers);
    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| sched.worker_loop());
        }
        let r = std::panic::catch_unwind(AssertUnwindSafe(|| f(&sched)));
        sched.shutdown();
        match r {
            Ok(v) => {
                sched.check_panicked();
                v
            }
            Err(p) => std::panic::resume_unwind(p),
        }
    })
}
