//! # Topic Bus
//!
//! An in-process publish/subscribe broker. Callers register interest in a
//! named topic and receive every message published to it afterwards.
//!
//! ## Core Concepts
//!
//! - **Topics**: plain string keys, no hierarchy or wildcards
//! - **Channel subscriptions**: a bounded queue the caller drains itself
//! - **Handler subscriptions**: a dispatch thread calls a handler per message
//! - **Audit sink**: an optional append-only log with one line per publish
//!
//! Publishing never blocks on a slow subscriber. What happens when a
//! subscriber's queue is full is chosen by [`OverflowPolicy`].
//!
//! ## Example
//!
//! ```ignore
//! use topicbus::Broker;
//!
//! let broker = Broker::<String>::new();
//! broker.activate_sink("audit.log")?;
//!
//! let orders = broker.subscribe("orders");
//! let printer = broker.subscribe_with_handler("orders", |msg| println!("got {msg}"))?;
//!
//! broker.publish("orders", "A".to_string())?;
//! assert_eq!(orders.recv()?, "A");
//!
//! printer.cancel();
//! broker.unsubscribe("orders", &orders);
//! broker.deactivate_sink()?;
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod sink;
pub mod subscriptions;

// Re-exports
pub use broker::Broker;
pub use config::{BrokerConfig, OverflowPolicy, SinkFailurePolicy};
pub use error::{BrokerError, Result};
pub use sink::{AuditFormat, AuditRecord, AuditSink, FileSink};
pub use subscriptions::{HandlerSubscription, Subscription, SubscriptionId};
