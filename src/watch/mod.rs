//! Event/watch queue
//!
//! - `WatchEvent`: immutable record of one object change
//! - `Matcher`: predicate selecting events for a subscriber
//! - `WatchQueue`: per-subscriber buffered fan-out

pub mod event;
pub mod matcher;
pub mod queue;

pub use event::{EventAction, WatchEvent};
pub use matcher::Matcher;
pub use queue::{CancelHandle, Subscription, WatchQueue};
