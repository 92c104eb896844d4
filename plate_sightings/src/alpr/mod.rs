//! Tracked-vehicle consensus and finalization engine.

pub mod aggregator;
pub mod consensus;
pub mod finalize;
pub mod index;
pub mod recovery;
pub mod registry;
pub mod render;
pub mod session;
pub mod transient;
