//! `ctlplane-core`: storage-agnostic building blocks for the control plane.
//!
//! This crate contains **pure** primitives (no threads, no IO): entity identity,
//! a substitutable clock, the shared `QuerySpec` filtering vocabulary, and the
//! store error model used by every store implementation.

pub mod clock;
pub mod entity;
pub mod error;
pub mod panic;
pub mod query;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::Entity;
pub use error::{QueryError, StoreError, StoreResult};
pub use panic::panic_message;
pub use query::{Criterion, Operator, QuerySpec, Queryable, SortOrder};
