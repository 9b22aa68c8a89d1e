//! Real-time spectrum, band and bracket extraction on a small parallel
//! processing pipeline.

pub mod analysis;
pub mod audio;
pub mod buffer;
pub mod config;
pub mod error;
pub mod pipeline;

pub use error::{Error, Result};
