use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
#[cfg(test)] use mockall::automock;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The execution context a transport runs its connections' work on. Protocol code reaches it
///  through [SchedulerHandle]s to post additional work.
#[cfg_attr(test, automock)]
pub trait Scheduler: Send + Sync + 'static {
    /// Queues a job for execution, returning `false` if the scheduler does not accept work
    ///  (any more).
    fn post(&self, job: Job) -> bool;

    /// Runs at most one pending job in the calling context. Returns `false` if the scheduler is
    ///  not running, `true` otherwise - including when there was nothing to run.
    fn run_once(&self) -> bool;
}

#[derive(Clone)]
pub struct SchedulerHandle {
    scheduler: Arc<dyn Scheduler>,
}

impl Debug for SchedulerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SchedulerHandle")
    }
}

impl SchedulerHandle {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> SchedulerHandle {
        SchedulerHandle { scheduler }
    }

    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.scheduler.post(Box::new(job))
    }

    pub fn run_once(&self) -> bool {
        self.scheduler.run_once()
    }
}


/// A FIFO job queue. Jobs are executed by any number of [IoScheduler::run_loop] tasks sharing the
///  scheduler, or inline by [Scheduler::run_once].
///
/// Jobs run outside the queue lock, so a job may post further jobs or call `run_once` itself.
pub struct IoScheduler {
    queue: Mutex<VecDeque<Job>>,
    job_posted: Notify,
    is_shut_down: AtomicBool,
}

impl IoScheduler {
    pub fn new() -> Arc<IoScheduler> {
        Arc::new(IoScheduler {
            queue: Default::default(),
            job_posted: Notify::new(),
            is_shut_down: AtomicBool::new(false),
        })
    }

    pub fn handle(self: &Arc<Self>) -> SchedulerHandle {
        SchedulerHandle::new(self.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    pub fn num_pending(&self) -> usize {
        self.queue.lock()
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Stops all run loops and discards pending jobs. Dropping a job releases everything it
    ///  holds, including endpoint references.
    pub fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down scheduler");

        let discarded = match self.queue.lock() {
            Ok(mut q) => std::mem::take(&mut *q),
            Err(_) => VecDeque::new(),
        };
        if !discarded.is_empty() {
            debug!("discarding {} pending jobs", discarded.len());
        }
        drop(discarded);

        self.job_posted.notify_waiters();
    }

    /// Executes jobs as they are posted until the scheduler is shut down.
    pub async fn run_loop(&self) {
        trace!("starting scheduler loop");

        loop {
            let notified = self.job_posted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while let Some(job) = self.pop_job() {
                Self::run_job(job);
                tokio::task::yield_now().await;
            }

            if self.is_shut_down() {
                break;
            }
            notified.await;
        }

        trace!("scheduler loop finished");
    }

    fn pop_job(&self) -> Option<Job> {
        if self.is_shut_down() {
            return None;
        }
        self.queue.lock().ok()?.pop_front()
    }

    fn run_job(job: Job) {
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("scheduled job panicked");
        }
    }
}

impl Scheduler for IoScheduler {
    fn post(&self, job: Job) -> bool {
        if self.is_shut_down() {
            debug!("scheduler is shut down, rejecting job");
            return false;
        }

        match self.queue.lock() {
            Ok(mut q) => q.push_back(job),
            Err(_) => {
                error!("scheduler queue is poisoned");
                return false;
            }
        }
        self.job_posted.notify_one();
        true
    }

    fn run_once(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        if let Some(job) = self.pop_job() {
            Self::run_job(job);
        }
        true
    }
}
