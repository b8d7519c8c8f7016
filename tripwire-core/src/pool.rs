// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Fixed-size async worker pool.
//!
//! N tokio tasks share one job queue. Each job runs in its own task so a panic
//! is contained and logged. A bounded pool admits at most one job per worker,
//! queued or running, and `submit` waits for a free slot. Shutting the pool
//! down closes the queue, discards jobs that were queued but not started, and
//! waits for running jobs to finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{TripwireError, TripwireResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool of worker tasks running submitted futures.
pub struct WorkerPool {
    name: &'static str,
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    slots: Option<Arc<Semaphore>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers on the current runtime with an unbounded backlog.
    /// A size of zero is raised to one.
    pub fn new(name: &'static str, size: usize) -> Self {
        Self::spawn(name, size, false)
    }

    /// Like [`WorkerPool::new`], but `submit` waits until a worker is free.
    pub fn bounded(name: &'static str, size: usize) -> Self {
        Self::spawn(name, size, true)
    }

    fn spawn(name: &'static str, size: usize, bounded: bool) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let stopped = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU64::new(0));

        let workers = (0..size)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let stopped = Arc::clone(&stopped);
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    loop {
                        // Only the receive is serialized; jobs run concurrently.
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        // A panicking job surfaces as a JoinError; the worker survives it.
                        if let Err(e) = tokio::spawn(job).await {
                            tracing::error!(pool = name, worker, error = %e, "Job failed");
                        }
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::trace!(pool = name, worker, "Worker exiting");
                })
            })
            .collect();

        tracing::debug!(pool = name, size, bounded, "Worker pool started");

        Self {
            name,
            sender: std::sync::Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stopped,
            completed,
            slots: bounded.then(|| Arc::new(Semaphore::new(size))),
            size,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs finished so far, failed ones included.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Queue a job, waiting for a free slot on a bounded pool. Fails once the
    /// pool has been shut down; the job is dropped unstarted in that case.
    pub async fn submit<F>(&self, job: F) -> TripwireResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(TripwireError::ShutDown);
        }

        let permit = match &self.slots {
            Some(slots) => Some(
                Arc::clone(slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| TripwireError::ShutDown)?,
            ),
            None => None,
        };

        self.enqueue(Box::pin(async move {
            // Held until the job finishes or is dropped.
            let _permit = permit;
            job.await
        }))
    }

    fn enqueue(&self, job: Job) -> TripwireResult<()> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) if !self.is_shut_down() => {
                sender.send(job).map_err(|_| TripwireError::ShutDown)
            }
            _ => Err(TripwireError::ShutDown),
        }
    }

    /// Stop accepting jobs, drop queued ones and wait for running ones.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // Wakes submitters waiting for a slot.
        if let Some(slots) = &self.slots {
            slots.close();
        }

        // Closing the sender wakes idle workers with `None`.
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(pool = self.name, error = %e, "Worker task failed");
            }
        }

        tracing::debug!(pool = self.name, completed = self.completed(), "Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("bounded", &self.slots.is_some())
            .field("stopped", &self.is_shut_down())
            .finish()
    }
}
