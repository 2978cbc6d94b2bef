//! Job scheduler: a bounded worker pool with a deferred time queue.
//!
//! Ready jobs run FIFO on worker threads hired on demand up to `max_workers`;
//! idle workers above `min_workers` retire after a grace interval. Deferred
//! jobs sit in a time-ordered queue drained by a dedicated timer thread that
//! migrates due jobs to the ready queue. There are no priorities and no
//! cancellation; jobs must be self-bounded.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

/// How long an idle worker above the minimum lingers before retiring.
const IDLE_GRACE: Duration = Duration::from_secs(20);

/// A schedulable unit of work.
///
/// A periodic job reschedules itself from inside `run` via the scheduler
/// handle it is given (the scrubber idiom).
pub trait Job: Send + Sync {
    /// Short description for trace output.
    fn comment(&self) -> &'static str {
        "job"
    }

    /// Execute the job. Blocking I/O inside is allowed; the job may not
    /// assume it runs on any particular thread.
    fn run(self: Arc<Self>, sched: &Arc<Scheduler>);
}

struct OnceJob<F> {
    comment: &'static str,
    f: Mutex<Option<F>>,
}

impl<F: FnOnce() + Send + 'static> Job for OnceJob<F> {
    fn comment(&self) -> &'static str {
        self.comment
    }

    fn run(self: Arc<Self>, _sched: &Arc<Scheduler>) {
        if let Some(f) = self.f.lock().take() {
            f();
        }
    }
}

/// Wrap a closure as a one-shot job.
pub fn once_job<F: FnOnce() + Send + 'static>(comment: &'static str, f: F) -> Arc<dyn Job> {
    Arc::new(OnceJob {
        comment,
        f: Mutex::new(Some(f)),
    })
}

struct WorkState {
    queue: VecDeque<Arc<dyn Job>>,
    workers: usize,
    idle: usize,
    jobs_run: u64,
}

struct Deferred {
    when: Instant,
    job: Arc<dyn Job>,
}

/// The worker pool and time queue.
pub struct Scheduler {
    work: Mutex<WorkState>,
    work_avail: Condvar,
    timer: Mutex<Vec<Deferred>>,
    timer_rings: Condvar,
    min_workers: usize,
    max_workers: usize,
}

impl Scheduler {
    /// Create a scheduler and start its timer thread.
    pub fn new(min_workers: usize, max_workers: usize) -> io::Result<Arc<Scheduler>> {
        let sched = Arc::new(Scheduler {
            work: Mutex::new(WorkState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                jobs_run: 0,
            }),
            work_avail: Condvar::new(),
            timer: Mutex::new(Vec::new()),
            timer_rings: Condvar::new(),
            min_workers: min_workers.max(1),
            max_workers: max_workers.max(min_workers).max(1),
        });
        let timer_self = sched.clone();
        thread::Builder::new()
            .name("sched-timer".into())
            .spawn(move || timer_self.timer_main())?;
        Ok(sched)
    }

    /// Append a job to the ready queue, hiring a worker if none is idle
    /// and the pool is below its maximum.
    pub fn schedule(self: &Arc<Self>, job: Arc<dyn Job>) {
        let mut state = self.work.lock();
        state.queue.push_back(job);
        let hire = state.workers == 0 || (state.idle == 0 && state.workers < self.max_workers);
        if hire {
            state.workers += 1;
        }
        drop(state);
        self.work_avail.notify_one();
        if hire {
            self.hire_worker();
        }
    }

    /// Schedule a job to become ready after `delay`.
    pub fn schedule_in(self: &Arc<Self>, job: Arc<dyn Job>, delay: Duration) {
        self.schedule_at(job, Instant::now() + delay);
    }

    /// Schedule a job to become ready at `when`.
    pub fn schedule_at(self: &Arc<Self>, job: Arc<dyn Job>, when: Instant) {
        debug!(
            "scheduling {} in {:?}",
            job.comment(),
            when.saturating_duration_since(Instant::now())
        );
        let mut tq = self.timer.lock();
        let pos = tq.partition_point(|d| d.when <= when);
        let wake = pos == 0;
        tq.insert(pos, Deferred { when, job });
        drop(tq);
        if wake {
            self.timer_rings.notify_one();
        }
    }

    /// Number of jobs run so far and current worker count.
    pub fn stats(&self) -> (u64, usize, usize) {
        let state = self.work.lock();
        (state.jobs_run, state.workers, state.queue.len())
    }

    fn hire_worker(self: &Arc<Self>) {
        let me = self.clone();
        let res = thread::Builder::new()
            .name("sched-worker".into())
            .spawn(move || me.worker_main());
        if let Err(e) = res {
            error!("cannot start worker thread: {e}");
            self.work.lock().workers -= 1;
        }
    }

    fn worker_main(self: Arc<Self>) {
        loop {
            let mut state = self.work.lock();
            let job = loop {
                if let Some(job) = state.queue.pop_front() {
                    break Some(job);
                }
                state.idle += 1;
                let timed_out = self
                    .work_avail
                    .wait_for(&mut state, IDLE_GRACE)
                    .timed_out();
                state.idle -= 1;
                if timed_out && state.queue.is_empty() && state.workers > self.min_workers {
                    break None;
                }
            };
            match job {
                Some(job) => {
                    state.jobs_run += 1;
                    drop(state);
                    debug!("running {}", job.comment());
                    job.run(&self);
                }
                None => {
                    state.workers -= 1;
                    return;
                }
            }
        }
    }

    fn timer_main(self: Arc<Self>) {
        loop {
            let mut tq = self.timer.lock();
            let now = Instant::now();
            match tq.first() {
                Some(first) if first.when <= now => {
                    let due = tq.remove(0);
                    drop(tq);
                    self.schedule(due.job);
                }
                Some(first) => {
                    let wait = first.when - now;
                    self.timer_rings.wait_for(&mut tq, wait);
                }
                None => {
                    self.timer_rings
                        .wait_for(&mut tq, Duration::from_secs(3600));
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (run, workers, queued) = {
            let state = self.work.lock();
            (state.jobs_run, state.workers, state.queue.len())
        };
        write!(
            f,
            "Scheduler(run={run} workers={workers}/{} queued={queued})",
            self.max_workers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_ready_jobs() {
        let sched = Scheduler::new(1, 4).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let count = count.clone();
            sched.schedule(once_job("bump", move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 16 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn deferred_jobs_fire_in_order() {
        let sched = Scheduler::new(1, 2).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        for (tag, delay_ms) in [(2u32, 120u64), (1, 60), (3, 180)] {
            let order = order.clone();
            sched.schedule_at(
                once_job("tagged", move || order.lock().push(tag)),
                now + Duration::from_millis(delay_ms),
            );
        }
        thread::sleep(Duration::from_millis(500));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn periodic_job_reschedules_itself() {
        struct Tick {
            count: AtomicUsize,
        }
        impl Job for Tick {
            fn comment(&self) -> &'static str {
                "tick"
            }
            fn run(self: Arc<Self>, sched: &Arc<Scheduler>) {
                if self.count.fetch_add(1, Ordering::SeqCst) < 2 {
                    sched.schedule_in(self.clone(), Duration::from_millis(20));
                }
            }
        }
        let sched = Scheduler::new(1, 2).unwrap();
        let tick = Arc::new(Tick {
            count: AtomicUsize::new(0),
        });
        sched.schedule(tick.clone());
        thread::sleep(Duration::from_millis(400));
        assert_eq!(tick.count.load(Ordering::SeqCst), 3);
    }
}
