use thiserror::Error;

use crate::pipeline::LifecycleState;

/// Errors raised while building or ticking an analysis pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unit '{unit}' requires a '{capability}' provider but none is registered")]
    MissingDependency {
        unit: String,
        capability: &'static str,
    },

    #[error("channel {channel} is out of range for a {channels}-channel source")]
    InvalidChannel { channel: usize, channels: usize },

    #[error("channel selection is empty")]
    EmptyChannelSelection,

    #[error("invalid frequency range: start={start}, length={length}")]
    InvalidRange { start: f32, length: f32 },

    #[error("unsupported bin count {0} (expected a power of two between 64 and 8192)")]
    InvalidBinCount(usize),

    #[error("unsupported band resolution {0} (expected 8, 16, 32, 64 or 128)")]
    InvalidResolution(usize),

    #[error("smoothing rate {0} is outside (0, 1]")]
    InvalidSmoothing(f32),

    #[error("unit '{unit}' expected state {expected:?} but was {found:?}")]
    Lifecycle {
        unit: String,
        expected: LifecycleState,
        found: LifecycleState,
    },

    #[error("a tick is already in flight")]
    TickInFlight,

    #[error("no tick is in flight")]
    NoTickInFlight,

    #[error("compound is faulted by an earlier configuration error")]
    Faulted,

    #[error("compound has been disposed")]
    Disposed,

    #[error("worker lane panicked: {0}")]
    WorkerPanicked(String),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("a unit named '{0}' is already registered")]
    DuplicateUnit(String),

    #[error("no unit named '{0}'")]
    UnknownUnit(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration, unit lifecycle and worker errors poison the compound until it
    /// is reconfigured. Tick calls made out of turn are rejected without faulting.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::TickInFlight | Error::NoTickInFlight | Error::Faulted | Error::Disposed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
