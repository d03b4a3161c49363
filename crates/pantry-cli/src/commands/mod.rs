//! Command handlers

pub mod config;
pub mod conflicts;
pub mod entity;
pub mod queue;
pub mod status;
pub mod sync;
