//! Engine error types
//!
//! [`TransportError`] classifies failures reported by the native USB stack.
//! [`EngineError`] is what the public engine API returns.

use crate::state::LifecycleState;
use common::DeathReason;
use thiserror::Error;

/// Failure classes reported by a transport back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("no such device")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("overflow")]
    Overflow,
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("operation not supported")]
    NotSupported,
    #[error("insufficient isochronous bandwidth")]
    NoBandwidth,
    #[error("insufficient memory")]
    NoMemory,
    #[error("interrupted")]
    Interrupted,
    #[error("other transport error")]
    Other,
}

impl TransportError {
    /// How a submission failure of this kind is reported to the client
    pub fn death_reason(self) -> DeathReason {
        match self {
            TransportError::NoBandwidth => DeathReason::NoBandwidth,
            TransportError::NoDevice | TransportError::Timeout => DeathReason::NotResponding,
            TransportError::Access | TransportError::NotSupported | TransportError::InvalidParam => {
                DeathReason::BadDriver
            }
            _ => DeathReason::UnknownError,
        }
    }
}

/// Map rusb::Error to TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::NotSupported => TransportError::NotSupported,
        rusb::Error::NoMem => TransportError::NoMemory,
        rusb::Error::Interrupted => TransportError::Interrupted,
        _ => TransportError::Other,
    }
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        map_rusb_error(err)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation not allowed while device is {0:?}")]
    InvalidState(LifecycleState),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No free transfer buffer on endpoint {0:#04x}")]
    PoolExhausted(u8),

    #[error("Failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl From<rusb::Error> for EngineError {
    fn from(err: rusb::Error) -> Self {
        EngineError::Transport(map_rusb_error(err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransportError::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransportError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), TransportError::NotFound);
        assert_eq!(map_rusb_error(rusb::Error::Other), TransportError::Other);
    }

    #[test]
    fn test_death_reason_mapping() {
        assert_eq!(
            TransportError::NoBandwidth.death_reason(),
            DeathReason::NoBandwidth
        );
        assert_eq!(
            TransportError::NoDevice.death_reason(),
            DeathReason::NotResponding
        );
        assert_eq!(TransportError::Access.death_reason(), DeathReason::BadDriver);
        assert_eq!(TransportError::Io.death_reason(), DeathReason::UnknownError);
    }
}
