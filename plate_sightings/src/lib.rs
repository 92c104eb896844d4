pub mod adapters;
pub mod alpr;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use error::{Error, Result};
