//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report the different kinds of failures that can occur while talking to
//! instruments on the GPIB bus, writing the output artifact, or loading the
//! configuration.
//!
//! ## Error Hierarchy
//!
//! - **`Bus`**: A transport-level failure. Carries the raw status word, the
//!   driver error code, the byte count and a decoded human-readable message
//!   (see [`crate::gpib::status::err_msg`]).
//! - **`DeviceNotPresent`**: Nothing answered the listener probe at the
//!   configured address. Distinct from a generic open failure so a boundary
//!   layer can offer retry/ignore.
//! - **`InvalidMode`**: An impedance-parameter code outside the 20-entry table.
//!   Rejected before the bus is touched.
//! - **`File`**: The output artifact could not be created or written.
//! - **`ConfigurationAbort`**: One step of an initialization or correction
//!   command sequence failed. Commands already accepted by the instrument
//!   remain in effect.
//! - **`Config`** / **`Configuration`**: Loading or semantic validation of the
//!   configuration failed.
//!
//! Transport errors are never retried. They abort the compound operation in
//! progress and are surfaced to the caller, which decides what to do next.

use crate::acquisition::Phase;
use crate::gpib::status::{err_msg, IbErr, StatusWord};
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Transport-level failure reported by the GPIB driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {message}")]
pub struct BusError {
    /// Call site or command that failed.
    pub context: String,
    /// Raw status word (`ibsta`).
    pub status: StatusWord,
    /// Raw driver error code (`iberr`).
    pub error: IbErr,
    /// Byte count of the failed transfer (`ibcnt`).
    pub count: usize,
    /// Decoded status/error/count registers.
    pub message: String,
}

impl BusError {
    /// Builds an error from the raw registers, decoding them immediately.
    pub fn new(context: impl Into<String>, status: StatusWord, error: IbErr, count: usize) -> Self {
        let status = status | StatusWord::ERR;
        Self {
            context: context.into(),
            status,
            error,
            count,
            message: err_msg(status, error, count),
        }
    }

    /// Replaces the call-site context, keeping the decoded registers.
    pub fn within(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// True when the driver reported a timeout.
    pub fn is_timeout(&self) -> bool {
        self.status.contains(StatusWord::TIMO)
    }
}

/// Every failure the library reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Driver call failed.
    #[error("GPIB bus error: {0}")]
    Bus(#[from] BusError),

    /// Nothing answered the listener probe.
    #[error("No listener at GPIB{board} address {address}")]
    DeviceNotPresent {
        /// Board index.
        board: u32,
        /// Primary address probed.
        address: u8,
    },

    /// Impedance mode code outside 0-19.
    #[error("Invalid impedance mode {0}: valid codes are 0-19")]
    InvalidMode(i32),

    /// The output file could not be created or written.
    #[error("Cannot write output file {}: {source}", path.display())]
    File {
        /// File being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// One command of a sequence failed; earlier commands remain in effect.
    #[error("Configuration sequence aborted at '{step}': {source}")]
    ConfigurationAbort {
        /// Command that failed.
        step: String,
        /// Driver error of that command.
        #[source]
        source: BusError,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A setting or argument is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An instrument reply could not be interpreted.
    #[error("Unexpected response to {what}: '{response}'")]
    Parse {
        /// Query that was answered.
        what: String,
        /// The reply as received.
        response: String,
    },

    /// Command issued on a closed session.
    #[error("Instrument session is not open")]
    NotConnected,

    /// Another compound operation is active.
    #[error("Cannot start a new operation while {0} is active")]
    OperationInProgress(Phase),

    /// The binary was built without the named cargo feature.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Shorthand for a response that could not be interpreted.
    pub fn parse(what: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            response: response.into(),
        }
    }

    /// The underlying bus error, if this failure came from the transport.
    pub fn bus_error(&self) -> Option<&BusError> {
        match self {
            Self::Bus(e) => Some(e),
            Self::ConfigurationAbort { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
