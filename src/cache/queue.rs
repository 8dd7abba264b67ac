//! Work Queues
//!
//! Multi-producer, multi-consumer FIFO queues drained by fixed worker pools.
//!
//! ```text
//!   producers ──enqueue──▶ [ WorkQueue<T> ] ──dequeue──▶ worker 0..n
//!                                                         │
//!                                     catch_unwind ◀──────┘
//! ```
//!
//! Producers never block. Consumers share one receiver behind an async lock,
//! so at most one worker waits on the channel at a time and items are handed
//! out in FIFO order.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Unbounded FIFO shared by a pool of workers
pub struct WorkQueue<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<tokio::sync::RwLock<mpsc::UnboundedReceiver<T>>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Arc::new(tokio::sync::RwLock::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item; returns immediately
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(item).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            Error::Internal(format!("{} queue is closed", self.name))
        })
    }

    /// Wait for the next item
    pub async fn dequeue(&self) -> Option<T> {
        let item = {
            let mut rx = self.rx.write().await;
            rx.recv().await
        };
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Items waiting to be dequeued
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn `workers` loops draining this queue until `cancel` fires.
    ///
    /// A panic while handling one item is logged and the loop moves on to the
    /// next item.
    pub fn spawn_workers<F, Fut>(
        &self,
        workers: usize,
        cancel: CancellationToken,
        handler: F,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let cancel = cancel.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    debug!(queue = queue.name, worker, "Worker started");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            item = queue.dequeue() => {
                                let Some(item) = item else { break };
                                if let Err(panic) = AssertUnwindSafe(handler(item)).catch_unwind().await {
                                    error!(
                                        queue = queue.name,
                                        worker,
                                        "Worker recovered from panic: {}",
                                        panic_message(&*panic)
                                    );
                                }
                            }
                        }
                    }
                    debug!(queue = queue.name, worker, "Worker stopped");
                })
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

// =============================================================================
// Tests
// =============================================================================
