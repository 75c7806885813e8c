//! Change-data capture over entity stores.
//!
//! `ChangeCaptureStore` decorates any `EntityStore` and turns each committed
//! mutation into a sequenced `ChangeEvent`, delivered synchronously to the
//! registered listeners. `StateChangeTaskProducer` is the standard listener:
//! it enqueues a task when a process enters a routed state.

pub mod capture;
pub mod entity_store;
pub mod producer;

pub use capture::ChangeCaptureStore;
pub use entity_store::{EntityStore, InMemoryEntityStore};
pub use producer::{ProcessEntity, StateChangeTaskProducer};
