// Copyright 2024 The sshlogd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A plain fixed-size worker pool for action execution. Sized once at
//! startup to `available_parallelism() * ACTION_POOL_CPU_MULTIPLIER`, shared
//! by every [`EventSubscription`](super::runtime::EventSubscription) in the
//! plugin runtime.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> WorkerPool {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size.max(1))
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                thread::Builder::new()
                    .name(format!("action-pool-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawning action pool worker")
            })
            .collect();

        WorkerPool { tx, workers }
    }

    /// Default size: CPU count times the action-pool multiplier constant.
    pub fn default_sized() -> WorkerPool {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        WorkerPool::new(cpus * crate::consts::ACTION_POOL_CPU_MULTIPLIER)
    }

    /// Submits `job` to run on the pool. Never blocks: the queue is
    /// unbounded, since actions may perform arbitrary (possibly slow) I/O
    /// and the bus's publish path must not stall waiting for capacity.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("action pool is shut down; dropping submitted job");
        }
    }

    /// Stops accepting new work and waits for everything already queued to
    /// finish, then joins the worker threads.
    pub fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
