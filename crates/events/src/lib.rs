//! Change-data-capture events: the ordered stream of entity mutations.
//!
//! - `ChangeEvent`: one committed mutation, stamped with a process-wide sequence
//! - `ChangeListener` / `ChangeRegistry`: synchronous subscription contract
//! - `ChangeLog`: append-only, retention-bounded in-memory log
//! - `Subscription`: channel-backed listener for consumers on other threads

pub mod bus;
pub mod change;
pub mod listener;
pub mod log;

pub use bus::{ChannelListener, Subscription};
pub use change::{ChangeEvent, ChangeType};
pub use listener::{ChangeListener, ChangeRegistry, ListenerError, ListenerId, ListenerSet};
pub use log::{ChangeLog, ChangeLogError, RetentionPolicy, SequenceGenerator};
