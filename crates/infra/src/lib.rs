//! Infrastructure layer: task storage and dispatch, change capture, config.

pub mod cdc;
pub mod config;
pub mod tasks;
