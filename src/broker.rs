//! The topic broker: subscription registry, fan-out, and audit sink.

use crate::config::{BrokerConfig, OverflowPolicy, SinkFailurePolicy};
use crate::error::{BrokerError, Result};
use crate::sink::{AuditRecord, AuditSink, FileSink};
use crate::subscriptions::types::{endpoint_pair, CloseSignal, Endpoint};
use crate::subscriptions::{HandlerSubscription, Subscription, SubscriptionId};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Turns a payload into the message text of an audit line.
type Renderer<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

/// In-process publish/subscribe broker for payloads of type `T`.
///
/// Cheap to clone; clones share the same registry and sink.
///
/// Locking: the registry sits behind one reader/writer lock. `publish` holds
/// the read lock for the audit append and the fan-out; `subscribe`,
/// `unsubscribe` and topic closing take the write lock across all topics.
///
/// Payloads only need `Display` for the audit sink's convenience methods;
/// other payloads pass a renderer to `activate_sink_with_renderer`.
pub struct Broker<T> {
    inner: Arc<BrokerInner<T>>,
}

struct BrokerInner<T> {
    /// Topic name to endpoints, in subscription order.
    topics: RwLock<HashMap<String, Vec<Endpoint<T>>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Active audit sink, if any.
    sink: Mutex<Option<ActiveSink<T>>>,
    /// Live forwarder threads across all endpoints.
    delivery_threads: Arc<AtomicUsize>,
    config: BrokerConfig,
}

struct ActiveSink<T> {
    sink: Box<dyn AuditSink>,
    render: Renderer<T>,
}

/// Counts a forwarder thread for as long as it lives.
struct LiveThread(Arc<AtomicUsize>);

impl LiveThread {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    /// Create an empty broker with default configuration.
    pub fn new() -> Self {
        Self::from_parts(BrokerConfig::default())
    }

    /// Create a broker, activating the audit sink if `audit_path` is set.
    pub fn with_config(config: BrokerConfig) -> Result<Self>
    where
        T: fmt::Display,
    {
        Self::with_config_and_renderer(config, |message: &T| message.to_string())
    }

    /// Like [`with_config`](Self::with_config), rendering audited payloads
    /// with `render`.
    pub fn with_config_and_renderer<R>(config: BrokerConfig, render: R) -> Result<Self>
    where
        R: Fn(&T) -> String + Send + Sync + 'static,
    {
        let audit_path = config.audit_path.clone();
        let broker = Self::from_parts(config);
        if let Some(path) = audit_path {
            let sink = FileSink::open(&path)?;
            tracing::debug!(path = %path.display(), "audit sink activated");
            broker.activate_sink_with_renderer(Box::new(sink), render);
        }
        Ok(broker)
    }

    fn from_parts(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                sink: Mutex::new(None),
                delivery_threads: Arc::new(AtomicUsize::new(0)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    // --- Audit Sink ---

    /// Open (or create) `path` in append mode and make it the audit sink.
    pub fn activate_sink(&self, path: impl AsRef<Path>) -> Result<&Self>
    where
        T: fmt::Display,
    {
        let sink = FileSink::open(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "audit sink activated");
        Ok(self.activate_sink_with(Box::new(sink)))
    }

    /// Install any sink, replacing (and closing) the active one.
    pub fn activate_sink_with(&self, sink: Box<dyn AuditSink>) -> &Self
    where
        T: fmt::Display,
    {
        self.activate_sink_with_renderer(sink, |message: &T| message.to_string())
    }

    /// Install a sink whose lines carry `render(payload)` as the message.
    pub fn activate_sink_with_renderer<R>(&self, sink: Box<dyn AuditSink>, render: R) -> &Self
    where
        R: Fn(&T) -> String + Send + Sync + 'static,
    {
        let active = ActiveSink {
            sink,
            render: Box::new(render),
        };
        let previous = self.inner.sink.lock().replace(active);
        if let Some(previous) = previous {
            if let Err(e) = previous.sink.close() {
                tracing::warn!(error = %e, "failed to close replaced audit sink");
            }
        }
        self
    }

    /// Close the active sink. A no-op when no sink is active.
    pub fn deactivate_sink(&self) -> Result<()> {
        let active = self.inner.sink.lock().take();
        match active {
            Some(active) => {
                tracing::debug!("audit sink deactivated");
                active.sink.close().map_err(BrokerError::SinkClose)
            }
            None => Ok(()),
        }
    }

    pub fn is_sink_active(&self) -> bool {
        self.inner.sink.lock().is_some()
    }

    // --- Registry ---

    /// Subscribe to `topic`. Never blocks, never fails.
    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (endpoint, subscription) = endpoint_pair(
            id,
            topic,
            self.inner.config.effective_buffer_size(),
            self.inner.config.overflow == OverflowPolicy::DropOldest,
        );

        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(endpoint);

        tracing::debug!(subscription_id = id.0, topic, "subscription created");
        subscription
    }

    /// Subscribe with a handler run serially on a dedicated dispatch thread.
    pub fn subscribe_with_handler<F>(&self, topic: &str, handler: F) -> Result<HandlerSubscription>
    where
        F: FnMut(T) + Send + 'static,
    {
        let subscription = self.subscribe(topic);
        let id = subscription.id();
        let thread_name = format!("{}-dispatch-{}", self.inner.config.thread_name_prefix, id);

        let broker = self.clone();
        let owned_topic = topic.to_string();
        let unsubscribe = Box::new(move || {
            broker.unsubscribe_id(&owned_topic, id);
        });

        match HandlerSubscription::spawn(subscription, handler, thread_name, unsubscribe) {
            Ok(guard) => Ok(guard),
            Err(e) => {
                // The subscription handle was dropped with the failed closure.
                self.unsubscribe_id(topic, id);
                Err(e)
            }
        }
    }

    /// Remove and close `subscription`. Returns false if it was not
    /// registered under `topic` (unknown topic or already removed).
    pub fn unsubscribe(&self, topic: &str, subscription: &Subscription<T>) -> bool {
        self.unsubscribe_id(topic, subscription.id())
    }

    /// Remove and close the subscription with `id` under `topic`.
    pub fn unsubscribe_id(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.inner.topics.write();
        let Some(endpoints) = topics.get_mut(topic) else {
            return false;
        };
        let Some(index) = endpoints.iter().position(|e| e.id == id) else {
            return false;
        };

        let endpoint = endpoints.remove(index);
        endpoint.signal.close();
        if endpoints.is_empty() {
            topics.remove(topic);
        }

        tracing::debug!(subscription_id = id.0, topic, "subscription removed");
        true
    }

    /// Close and remove every subscriber of `topic`. Returns how many.
    pub fn close_topic(&self, topic: &str) -> usize {
        let removed = self.inner.topics.write().remove(topic);
        let endpoints = removed.unwrap_or_default();
        for endpoint in &endpoints {
            endpoint.signal.close();
        }
        if !endpoints.is_empty() {
            tracing::debug!(topic, subscribers = endpoints.len(), "topic closed");
        }
        endpoints.len()
    }

    /// Close every subscription on every topic.
    pub fn close_all(&self) {
        let mut topics = self.inner.topics.write();
        for (_, endpoints) in topics.drain() {
            for endpoint in endpoints {
                endpoint.signal.close();
            }
        }
    }

    /// Number of open subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|endpoints| endpoints.iter().filter(|e| !e.signal.is_closed()).count())
            .unwrap_or(0)
    }

    /// Snapshot of topics that currently have subscribers.
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.read().keys().cloned().collect()
    }

    // --- Publishing ---

    /// Publish `message` to every current subscriber of `topic`.
    ///
    /// Returns the number of deliveries initiated. Returns once fan-out has
    /// been initiated, never waiting on a slow subscriber.
    pub fn publish(&self, topic: &str, message: T) -> Result<usize> {
        let mut stale = Vec::new();

        let delivered = {
            let topics = self.inner.topics.read();
            self.audit(topic, &message)?;

            let Some(endpoints) = topics.get(topic) else {
                tracing::trace!(topic, "no subscribers");
                return Ok(0);
            };

            let mut delivered = 0;
            for endpoint in endpoints {
                if endpoint.signal.is_closed() {
                    stale.push(endpoint.id);
                    continue;
                }
                if self.deliver(endpoint, message.clone()) {
                    delivered += 1;
                }
            }
            delivered
        };

        if !stale.is_empty() {
            self.prune(topic, &stale);
        }

        tracing::trace!(topic, delivered, "published");
        Ok(delivered)
    }

    /// Number of live forwarder threads. At most one per subscription.
    pub fn delivery_threads(&self) -> usize {
        self.inner.delivery_threads.load(Ordering::SeqCst)
    }

    /// Append one audit line if the sink is active.
    fn audit(&self, topic: &str, message: &T) -> Result<()> {
        let mut sink = self.inner.sink.lock();
        let Some(active) = sink.as_mut() else {
            return Ok(());
        };

        let record = AuditRecord::now(topic, (active.render)(message));
        let line = self.inner.config.audit_format.render(&record)?;

        let Err(e) = active.sink.append(&line) else {
            return Ok(());
        };

        match self.inner.config.sink_failure {
            SinkFailurePolicy::Propagate => Err(BrokerError::SinkWrite(e)),
            SinkFailurePolicy::Disable => {
                tracing::error!(topic, error = %e, "audit write failed, disabling sink");
                if let Some(failed) = sink.take() {
                    if let Err(close_err) = failed.sink.close() {
                        tracing::warn!(error = %close_err, "failed to close disabled audit sink");
                    }
                }
                Ok(())
            }
        }
    }

    // --- Delivery ---

    /// Hand `message` to one endpoint without blocking the caller.
    /// Returns whether a delivery was initiated.
    fn deliver(&self, endpoint: &Endpoint<T>, message: T) -> bool {
        match self.inner.config.overflow {
            OverflowPolicy::Park => self.park(endpoint, message),
            OverflowPolicy::DropNewest => match endpoint.sender.try_send(message) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(subscription_id = endpoint.id.0, "queue full, message dropped");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            OverflowPolicy::DropOldest => match endpoint.sender.try_send(message) {
                Ok(()) => true,
                Err(TrySendError::Full(message)) => {
                    if let Some(evictor) = &endpoint.evictor {
                        let _ = evictor.try_recv();
                    }
                    endpoint.sender.try_send(message).is_ok()
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }

    /// Enqueue directly until the queue first fills. From then on every
    /// message goes through the endpoint's backlog so publish order holds.
    fn park(&self, endpoint: &Endpoint<T>, message: T) -> bool {
        let mut backlog = endpoint.backlog.lock();
        if let Some(pending) = backlog.as_ref() {
            return self.push_backlog(endpoint, pending, message);
        }

        let message = match endpoint.sender.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(message)) => message,
        };

        match self.spawn_forwarder(endpoint) {
            Ok(pending) => {
                let queued = self.push_backlog(endpoint, &pending, message);
                *backlog = Some(pending);
                queued
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = endpoint.id.0,
                    error = %e,
                    "failed to spawn forwarder thread, message dropped"
                );
                false
            }
        }
    }

    fn push_backlog(&self, endpoint: &Endpoint<T>, pending: &Sender<T>, message: T) -> bool {
        match pending.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    subscription_id = endpoint.id.0,
                    park_limit = self.inner.config.effective_park_limit(),
                    "parked backlog full, message dropped"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Start the single forwarder thread for `endpoint`, returning the
    /// sending side of its backlog.
    fn spawn_forwarder(&self, endpoint: &Endpoint<T>) -> io::Result<Sender<T>> {
        let (pending, backlog) = bounded(self.inner.config.effective_park_limit());
        let sender = endpoint.sender.clone();
        let signal = Arc::clone(&endpoint.signal);
        let live = LiveThread::enter(&self.inner.delivery_threads);
        let name = format!(
            "{}-deliver-{}",
            self.inner.config.thread_name_prefix, endpoint.id
        );

        thread::Builder::new().name(name).spawn(move || {
            let _live = live;
            forward(backlog, sender, signal);
        })?;

        tracing::debug!(subscription_id = endpoint.id.0, "forwarder started");
        Ok(pending)
    }

    /// Remove endpoints found closed during fan-out.
    fn prune(&self, topic: &str, stale: &[SubscriptionId]) {
        let mut topics = self.inner.topics.write();
        if let Some(endpoints) = topics.get_mut(topic) {
            endpoints.retain(|e| !stale.contains(&e.id));
            if endpoints.is_empty() {
                topics.remove(topic);
            }
        }
        tracing::debug!(topic, pruned = stale.len(), "closed subscriptions pruned");
    }
}

/// Move backlog messages into the subscriber queue, one at a time, until
/// the subscription closes. Waiting on the close signal in both steps keeps
/// the thread from staying parked on a closed subscriber.
fn forward<T>(backlog: Receiver<T>, sender: Sender<T>, signal: Arc<CloseSignal>) {
    loop {
        let message = select! {
            recv(backlog) -> msg => match msg {
                Ok(message) => message,
                Err(_) => return,
            },
            recv(signal.listener()) -> _ => return,
        };
        select! {
            send(sender, message) -> res => {
                if res.is_err() {
                    return;
                }
            },
            recv(signal.listener()) -> _ => return,
        }
    }
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Broker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.inner.topics.read().len())
            .field("sink_active", &self.inner.sink.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn test_subscribe_unsubscribe() {
        let broker = Broker::<String>::new();

        let sub = broker.subscribe("orders");
        assert_eq!(broker.subscriber_count("orders"), 1);
        assert_eq!(broker.topics(), vec!["orders".to_string()]);

        assert!(broker.unsubscribe("orders", &sub));
        assert_eq!(broker.subscriber_count("orders"), 0);
        assert!(broker.topics().is_empty());
        assert!(sub.is_closed());
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let broker = Broker::<String>::new();
        let sub = broker.subscribe("orders");

        assert!(!broker.unsubscribe("other", &sub));
        assert!(!broker.unsubscribe_id("orders", SubscriptionId(999)));
        assert!(broker.unsubscribe("orders", &sub));
        assert!(!broker.unsubscribe("orders", &sub));
    }

    #[test]
    fn test_ids_are_unique() {
        let broker = Broker::<u32>::new();
        let a = broker.subscribe("t");
        let b = broker.subscribe("t");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let broker = Broker::<String>::new();
        let sub = broker.subscribe("orders");

        assert_eq!(broker.publish("orders", "A".to_string()).unwrap(), 1);
        assert_eq!(sub.recv_timeout(WAIT).unwrap(), "A");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broker = Broker::<String>::new();
        assert_eq!(broker.publish("nobody", "x".to_string()).unwrap(), 0);
    }

    #[test]
    fn test_drop_newest_on_full_queue() {
        let broker = Broker::<u32>::with_config(BrokerConfig {
            overflow: OverflowPolicy::DropNewest,
            ..Default::default()
        })
        .unwrap();
        let sub = broker.subscribe("t");

        assert_eq!(broker.publish("t", 1).unwrap(), 1);
        assert_eq!(broker.publish("t", 2).unwrap(), 0);
        assert_eq!(sub.recv_timeout(WAIT).unwrap(), 1);
        assert!(sub.recv_timeout(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_drop_oldest_on_full_queue() {
        let broker = Broker::<u32>::with_config(BrokerConfig {
            overflow: OverflowPolicy::DropOldest,
            ..Default::default()
        })
        .unwrap();
        let sub = broker.subscribe("t");

        broker.publish("t", 1).unwrap();
        assert_eq!(broker.publish("t", 2).unwrap(), 1);
        assert_eq!(sub.recv_timeout(WAIT).unwrap(), 2);
    }

    #[test]
    fn test_park_delivers_in_order_after_drain() {
        let broker = Broker::<u32>::new();
        let sub = broker.subscribe("t");

        for i in 0..10 {
            assert_eq!(broker.publish("t", i).unwrap(), 1);
        }

        let got: Vec<u32> = (0..10).map(|_| sub.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stalled_subscriber_uses_one_forwarder() {
        let broker = Broker::<u32>::with_config(BrokerConfig {
            park_limit: 16,
            ..Default::default()
        })
        .unwrap();
        let sub = broker.subscribe("t");

        let delivered: usize = (0..2000).map(|i| broker.publish("t", i).unwrap()).sum();

        // Queue slot, backlog, and possibly one held by the forwarder.
        assert!((17..=18).contains(&delivered), "delivered {}", delivered);
        assert_eq!(broker.delivery_threads(), 1);

        broker.unsubscribe("t", &sub);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while broker.delivery_threads() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(broker.delivery_threads(), 0);
    }

    #[test]
    fn test_forwarder_per_stalled_subscriber() {
        let broker = Broker::<u32>::new();
        let subs: Vec<_> = (0..3).map(|_| broker.subscribe("t")).collect();

        for i in 0..100 {
            assert_eq!(broker.publish("t", i).unwrap(), 3);
        }
        assert_eq!(broker.delivery_threads(), 3);

        for sub in &subs {
            let got: Vec<u32> = (0..100).map(|_| sub.recv_timeout(WAIT).unwrap()).collect();
            assert_eq!(got, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_publish_non_display_payload() {
        let broker = Broker::<Vec<u8>>::new();
        let sub = broker.subscribe("bytes");

        assert_eq!(broker.publish("bytes", vec![1, 2, 3]).unwrap(), 1);
        assert_eq!(sub.recv_timeout(WAIT).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dropped_handle_is_pruned() {
        let broker = Broker::<u32>::new();
        let sub = broker.subscribe("t");
        drop(sub);

        assert_eq!(broker.subscriber_count("t"), 0);
        assert_eq!(broker.publish("t", 1).unwrap(), 0);
        assert!(broker.topics().is_empty());
    }

    #[test]
    fn test_close_topic() {
        let broker = Broker::<u32>::new();
        let a = broker.subscribe("t");
        let b = broker.subscribe("t");
        let other = broker.subscribe("u");

        assert_eq!(broker.close_topic("t"), 2);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(!other.is_closed());
        assert_eq!(broker.close_topic("t"), 0);

        broker.close_all();
        assert!(other.is_closed());
        assert!(broker.topics().is_empty());
    }

    #[test]
    fn test_clone_shares_registry() {
        let broker = Broker::<u32>::new();
        let clone = broker.clone();
        let sub = clone.subscribe("t");

        broker.publish("t", 3).unwrap();
        assert_eq!(sub.recv_timeout(WAIT).unwrap(), 3);
    }
}
