//! Per-agent priority inbox with a cooperative polling consumer.
//!
//! Messages are ordered by priority (high before normal before low) and by
//! arrival within the same priority. The consumer takes at most one message
//! per tick and awaits its handler before the next tick, so a single agent
//! never runs two turns at once.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use futures::FutureExt;
use switchboard_core::error::Error;
use switchboard_core::message::{Message, Priority};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct Queued {
    priority: Priority,
    seq: Reverse<u64>,
    message: Message,
}

impl Queued {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// The inbox of one agent.
pub struct Mailbox {
    queue: Mutex<BinaryHeap<Queued>>,
    next_seq: AtomicU64,
    in_flight: AtomicUsize,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Queue `message` under `priority`.
    pub fn enqueue(&self, message: Message, priority: Priority) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(
            message_id = %message.id(),
            session_id = %message.session_id(),
            ?priority,
            "Message enqueued"
        );
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Queued {
                priority,
                seq: Reverse(seq),
                message,
            });
    }

    /// Take the next message: highest priority first, oldest first within a priority.
    pub fn dequeue(&self) -> Option<Message> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .map(|q| q.message)
    }

    /// Messages waiting in the queue.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued messages plus the one being handled, if any.
    pub fn pending(&self) -> usize {
        self.len() + self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the consumer loop. Every `interval` at most one message is
    /// taken off the queue and passed to `handler`; the loop waits for the
    /// handler to finish before the next tick. Handler errors and panics are
    /// logged and the loop keeps polling.
    pub fn init<F, Fut>(self: &Arc<Self>, interval: Duration, handler: F) -> Result<JoinHandle<()>, Error>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("mailbox is already running".into()));
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();

        let mailbox = Arc::clone(self);
        info!(interval_ms = interval.as_millis() as u64, "Mailbox consumer started");

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(message) = mailbox.dequeue() else {
                    continue;
                };

                mailbox.in_flight.store(1, Ordering::SeqCst);
                let message_id = message.id().to_string();
                let session_id = message.session_id().to_string();
                let handled = AssertUnwindSafe(async { handler(message).await }).catch_unwind().await;
                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(%message_id, %session_id, error = %e, "Message handler failed"),
                    Err(panic) => error!(
                        %message_id,
                        %session_id,
                        panic = %panic_message(panic.as_ref()),
                        "Message handler panicked"
                    ),
                }
                mailbox.in_flight.store(0, Ordering::SeqCst);
            }

            mailbox.running.store(false, Ordering::SeqCst);
            info!(remaining = mailbox.len(), "Mailbox consumer stopped");
        }))
    }

    /// Stop the consumer loop. A turn already in progress runs to completion.
    /// Calling this more than once, or on a mailbox that never started, is a no-op.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if cancel.is_cancelled() {
            debug!("Mailbox stop already requested");
            return;
        }
        cancel.cancel();
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
