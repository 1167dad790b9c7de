use crate::common::ScanError;
use crate::scanner::CancelHandle;
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

/// Fixed-size pool of OS threads draining a queue of jobs
///
/// Jobs still queued when the scan is cancelled are skipped, never started.
pub(crate) struct Workqueue<J> {
    jobs: Mutex<VecDeque<J>>,
    workers: usize,
}

impl<J: Send> Workqueue<J> {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            workers: workers.max(1),
        }
    }

    // the caller enqueues all the jobs before starting the workers
    pub(crate) fn enqueue(&mut self, job: J) {
        self.jobs.get_mut().push_back(job);
    }

    fn pop(&self) -> Option<J> {
        self.jobs.lock().pop_front()
    }

    /// Run `f` on every job, returning the results in completion order
    pub(crate) fn run<R, F>(self, cancel: &CancelHandle, f: F) -> Result<Vec<R>, ScanError>
    where
        R: Send,
        F: Fn(J) -> Option<R> + Sync,
    {
        let queue = &self;
        let (result_sender, result_receiver) = unbounded();
        crossbeam::scope(|s| {
            for worker in 0..queue.workers {
                let result_sender = result_sender.clone();
                let f = &f;
                s.spawn(move |_| {
                    while let Some(job) = queue.pop() {
                        if cancel.is_cancelled() {
                            continue;
                        }
                        if let Some(r) = f(job) {
                            if result_sender.send(r).is_err() {
                                break;
                            }
                        }
                    }
                    debug!("worker {worker} done");
                });
            }
        })
        .map_err(|_| ScanError::WorkerPanicked)?;
        drop(result_sender);

        Ok(result_receiver.try_iter().collect())
    }
}
