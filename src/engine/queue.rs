//! Bounded FIFO queues between the feeder, the worker pool, and the dispatcher.
//!
//! # Architecture
//!
//! A queue is a crossbeam `bounded` channel split into a [`QueueProducer`]
//! and a [`QueueConsumer`]. Both sides observe a shared
//! [`CancellationToken`]; cancelling it wakes every blocked `put`/`take`.
//!
//! - `put` blocks while the queue is full and hands the item back when the
//!   token is cancelled or every consumer is gone.
//! - `take` blocks while the queue is empty and returns `None` (end of
//!   stream) when the token is cancelled, or once every producer has been
//!   dropped and the buffer is drained.
//! - Nothing is dropped silently: items still buffered after a cancel are
//!   recovered with [`QueueConsumer::drain`] so the caller can count them.

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Engine-wide cancellation signal.
///
/// Cancelling drops the internal sender, which disconnects the receiver and
/// makes any `select` waiting on it ready.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Cancel the token. Returns `true` for the call that actually cancelled it.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once cancelled.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

struct QueueShared {
    capacity: usize,
    high_water: AtomicUsize,
    cancel: CancellationToken,
}

/// Create a bounded queue of `capacity` items observing `cancel`.
pub fn bounded_queue<T>(
    capacity: usize,
    cancel: CancellationToken,
) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = bounded(capacity);
    let shared = Arc::new(QueueShared {
        capacity,
        high_water: AtomicUsize::new(0),
        cancel,
    });
    (
        QueueProducer {
            tx,
            shared: shared.clone(),
        },
        QueueConsumer { rx, shared },
    )
}

/// Sending half of a bounded queue.
pub struct QueueProducer<T> {
    tx: Sender<T>,
    shared: Arc<QueueShared>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Block until `item` is enqueued.
    ///
    /// Returns the item back when the queue was cancelled or has no consumers.
    pub fn put(&self, item: T) -> Result<(), T> {
        if self.shared.cancel.is_cancelled() {
            return Err(item);
        }

        let mut sel = Select::new();
        let send_idx = sel.send(&self.tx);
        let cancel_idx = sel.recv(self.shared.cancel.receiver());
        let oper = sel.select();
        match oper.index() {
            i if i == send_idx => match oper.send(&self.tx, item) {
                Ok(()) => {
                    self.shared
                        .high_water
                        .fetch_max(self.tx.len(), Ordering::Relaxed);
                    Ok(())
                }
                Err(err) => Err(err.into_inner()),
            },
            i if i == cancel_idx => {
                let _ = oper.recv(self.shared.cancel.receiver());
                Err(item)
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Largest number of items observed buffered at once.
    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water.load(Ordering::Relaxed)
    }
}

/// Receiving half of a bounded queue.
pub struct QueueConsumer<T> {
    rx: Receiver<T>,
    shared: Arc<QueueShared>,
}

impl<T> Clone for QueueConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueConsumer<T> {
    /// Block until an item is available.
    ///
    /// Returns `None` at end of stream: on cancellation, or once all
    /// producers are dropped and the buffer is empty.
    pub fn take(&self) -> Option<T> {
        if self.shared.cancel.is_cancelled() {
            return None;
        }

        let mut sel = Select::new();
        let recv_idx = sel.recv(&self.rx);
        let cancel_idx = sel.recv(self.shared.cancel.receiver());
        let oper = sel.select();
        match oper.index() {
            i if i == recv_idx => oper.recv(&self.rx).ok(),
            i if i == cancel_idx => {
                let _ = oper.recv(self.shared.cancel.receiver());
                None
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    /// Remove every buffered item without blocking.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Raw receiver, for `select!` loops that also watch other channels.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water.load(Ordering::Relaxed)
    }
}
