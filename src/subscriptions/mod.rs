//! Subscription handles for the broker.
//!
//! Two delivery modes share one primitive, a bounded queue plus a close-once
//! signal:
//! - [`Subscription`]: the caller drains the queue itself
//! - [`HandlerSubscription`]: a dispatch thread drains it and calls a handler
//!
//! # Example
//!
//! ```ignore
//! let broker = Broker::<String>::new();
//!
//! let orders = broker.subscribe("orders");
//! let audit = broker.subscribe_with_handler("orders", |msg| println!("{msg}"))?;
//!
//! broker.publish("orders", "A".to_string())?;
//! assert_eq!(orders.recv()?, "A");
//!
//! broker.unsubscribe("orders", &orders);
//! audit.cancel();
//! ```

mod handler;
pub(crate) mod types;

pub use handler::HandlerSubscription;
pub use types::{Subscription, SubscriptionId};
