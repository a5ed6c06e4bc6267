//! Broker configuration.

use crate::sink::AuditFormat;
use std::path::PathBuf;

/// What to do when a subscriber's queue is already full at publish time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Queue the message on a per-subscriber backlog of at most
    /// `park_limit` messages. One forwarder thread per subscriber moves the
    /// backlog into the queue in publish order and exits when the
    /// subscription closes. Messages beyond the limit are dropped.
    #[default]
    Park,
    /// Discard the incoming message for that subscriber.
    DropNewest,
    /// Evict the oldest queued message to make room for the incoming one.
    DropOldest,
}

/// What `publish` does when the audit sink fails to append a line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SinkFailurePolicy {
    /// Return the error from `publish` and skip fan-out for that message.
    #[default]
    Propagate,
    /// Close and deactivate the sink, log the failure, keep delivering.
    Disable,
}

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Per-subscriber queue capacity. Clamped to at least 1.
    /// Default: 1
    pub buffer_size: usize,

    /// Behavior on a full subscriber queue.
    pub overflow: OverflowPolicy,

    /// Backlog capacity per subscriber under `OverflowPolicy::Park`.
    /// Clamped to at least 1.
    /// Default: 1024
    pub park_limit: usize,

    /// Behavior on an audit write failure.
    pub sink_failure: SinkFailurePolicy,

    /// Line format used by the audit sink.
    pub audit_format: AuditFormat,

    /// Audit file to activate at construction (None = sink inactive).
    pub audit_path: Option<PathBuf>,

    /// Prefix for dispatch and delivery thread names.
    pub thread_name_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            overflow: OverflowPolicy::default(),
            park_limit: 1024,
            sink_failure: SinkFailurePolicy::default(),
            audit_format: AuditFormat::default(),
            audit_path: None,
            thread_name_prefix: "topicbus".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Queue capacity actually used for new subscriptions.
    pub(crate) fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(1)
    }

    /// Backlog capacity actually used for parked deliveries.
    pub(crate) fn effective_park_limit(&self) -> usize {
        self.park_limit.max(1)
    }
}
