//! Handler-mode subscriptions: a dispatch thread per subscription that turns
//! queued messages into callback invocations.

use super::types::{CloseSignal, Subscription, SubscriptionId};
use crate::error::{BrokerError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Guard for a handler subscription.
///
/// `cancel` (or dropping the guard) removes the subscription and stops its
/// dispatch thread. Once `cancel` returns, the handler is not called again.
#[must_use = "dropping a HandlerSubscription cancels it"]
pub struct HandlerSubscription {
    id: SubscriptionId,
    topic: String,
    signal: Arc<CloseSignal>,
    unsubscribe: Box<dyn Fn() + Send + Sync>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerSubscription {
    /// Start the dispatch thread for `subscription`.
    ///
    /// `unsubscribe` removes the registry entry; it runs on cancel.
    pub(crate) fn spawn<T, F>(
        subscription: Subscription<T>,
        mut handler: F,
        thread_name: String,
        unsubscribe: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let id = subscription.id();
        let topic = subscription.topic().to_string();
        let signal = Arc::clone(subscription.signal());

        let dispatcher = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for message in subscription.iter() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
                    if outcome.is_err() {
                        tracing::error!(
                            subscription_id = subscription.id().0,
                            topic = subscription.topic(),
                            "handler panicked, message dropped"
                        );
                    }
                }
                tracing::debug!(
                    subscription_id = subscription.id().0,
                    topic = subscription.topic(),
                    "dispatch stopped"
                );
            })
            .map_err(BrokerError::DispatchSpawn)?;

        Ok(Self {
            id,
            topic,
            signal,
            unsubscribe,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_closed()
    }

    /// Cancel the subscription. Safe to call more than once.
    ///
    /// Joins the dispatch thread, so an in-flight handler call finishes
    /// before this returns. Called from inside the handler it only signals.
    pub fn cancel(&self) {
        (self.unsubscribe)();
        self.signal.close();

        let dispatcher = self.dispatcher.lock().take();
        let Some(dispatcher) = dispatcher else {
            return;
        };
        if dispatcher.thread().id() == thread::current().id() {
            return;
        }
        if dispatcher.join().is_err() {
            tracing::error!(
                subscription_id = self.id.0,
                topic = %self.topic,
                "dispatch thread terminated abnormally"
            );
        }
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for HandlerSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSubscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
