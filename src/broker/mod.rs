//! The Connection Broker (§2): executor registry, correlation layer,
//! command dispatcher, and the replication engine that rides on top of them.

pub mod correlation;
pub mod dispatcher;
pub mod executor;
pub mod replication;

pub use correlation::{CorrelationLayer, StreamItem};
pub use dispatcher::{Dispatcher, PollOutcome, StreamingHandle};
pub use executor::{ExecutorHandle, ExecutorRegistry, OutboundFrame};
pub use replication::ReplicationEngine;
