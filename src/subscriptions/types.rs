//! Subscription handles and the endpoint state the broker keeps for them.

use crossbeam_channel::{bounded, select, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Opaque token identifying one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Close-once signal shared by a subscription handle, its registry endpoint,
/// and any delivery threads parked on it.
///
/// Closing drops the only trigger sender, which wakes every `select!` waiting
/// on the listener. A second close is a no-op.
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    listener: Receiver<()>,
}

impl CloseSignal {
    pub(crate) fn new() -> Arc<Self> {
        let (trigger, listener) = bounded(0);
        Arc::new(Self {
            closed: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            listener,
        })
    }

    /// Returns true only for the call that actually closed the signal.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.trigger.lock().take();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Becomes ready (with an error) once the signal is closed.
    pub(crate) fn listener(&self) -> &Receiver<()> {
        &self.listener
    }
}

/// Registry-side half of a subscription.
pub(crate) struct Endpoint<T> {
    pub(crate) id: SubscriptionId,
    pub(crate) sender: Sender<T>,
    /// Receiver clone used to evict the oldest message (DropOldest only).
    pub(crate) evictor: Option<Receiver<T>>,
    /// Overflow queue feeding the endpoint's forwarder thread (Park only).
    /// Created the first time the queue is found full.
    pub(crate) backlog: Mutex<Option<Sender<T>>>,
    pub(crate) signal: Arc<CloseSignal>,
}

/// Create both halves of a subscription.
pub(crate) fn endpoint_pair<T>(
    id: SubscriptionId,
    topic: &str,
    capacity: usize,
    keep_evictor: bool,
) -> (Endpoint<T>, Subscription<T>) {
    let (sender, receiver) = bounded(capacity);
    let signal = CloseSignal::new();

    let endpoint = Endpoint {
        id,
        sender,
        evictor: keep_evictor.then(|| receiver.clone()),
        backlog: Mutex::new(None),
        signal: Arc::clone(&signal),
    };
    let subscription = Subscription {
        id,
        topic: topic.to_string(),
        receiver,
        signal,
    };

    (endpoint, subscription)
}

/// Channel-mode subscription handle.
///
/// Once the subscription is closed (unsubscribed, its topic closed, or the
/// handle dropped) every receive reports disconnection.
pub struct Subscription<T> {
    id: SubscriptionId,
    topic: String,
    receiver: Receiver<T>,
    signal: Arc<CloseSignal>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the broker has closed this subscription.
    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    /// Receive the next message (blocking until a message or closure).
    pub fn recv(&self) -> Result<T, RecvError> {
        if self.is_closed() {
            return Err(RecvError);
        }
        select! {
            recv(self.receiver) -> msg => self.accept(msg, RecvError),
            recv(self.signal.listener()) -> _ => Err(RecvError),
        }
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if self.is_closed() {
            return Err(TryRecvError::Disconnected);
        }
        let msg = self.receiver.try_recv();
        self.accept(msg, TryRecvError::Disconnected)
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        if self.is_closed() {
            return Err(RecvTimeoutError::Disconnected);
        }
        select! {
            recv(self.receiver) -> msg => {
                self.accept(msg.map_err(|_| RecvTimeoutError::Disconnected), RecvTimeoutError::Disconnected)
            },
            recv(self.signal.listener()) -> _ => Err(RecvTimeoutError::Disconnected),
            default(timeout) => Err(RecvTimeoutError::Timeout),
        }
    }

    /// Blocking iterator that ends when the subscription closes.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.recv().ok())
    }

    pub(crate) fn signal(&self) -> &Arc<CloseSignal> {
        &self.signal
    }

    /// A message that raced in after closure is discarded.
    fn accept<E>(&self, msg: Result<T, E>, closed: E) -> Result<T, E> {
        let msg = msg?;
        if self.is_closed() {
            return Err(closed);
        }
        Ok(msg)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.signal.close();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}
