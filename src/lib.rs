//! A reactive dataflow runtime for sensor-style event streams: assemble
//! pipelines of publishers, filters, and subscribers, and run them under a
//! scheduler that mixes a single-threaded cooperative event loop with
//! worker threads for blocking sources and sinks.

pub mod bridge;
pub mod error;
pub mod filter;
pub mod operators;
pub mod publisher;
pub mod scheduler;
pub mod sources;
pub mod subscriber;
pub mod topic;

#[cfg(feature = "csv-adapter")]
pub mod adapters;

pub use error::{FatalError, Result};
pub use publisher::{EnqueueFn, Publisher};
pub use scheduler::{ScheduleId, Scheduler};
pub use subscriber::{ClosureSubscriber, Dispose, Subscriber, Subscription};
pub use topic::DEFAULT_TOPIC;
