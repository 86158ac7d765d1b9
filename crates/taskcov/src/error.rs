//! Error type for the control plane.
//!
//! Trace sinks and remote windows never fail loudly (see the crate docs);
//! everything that can be reported is reported from the session control
//! operations and the request dispatcher.

use thiserror::Error;

/// Errors returned by session control operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The session, or the calling task, is already in use.
    #[error("session or task busy")]
    Busy,

    /// Wrong session state, bad size, wrong owner, or malformed argument.
    #[error("invalid argument or session state")]
    InvalidArgument,

    /// Buffer allocation failed.
    #[error("buffer allocation failed")]
    NoMemory,

    /// A handle in the request is already registered.
    #[error("handle already registered")]
    Exists,

    /// The requested trace mode is not compiled into this build.
    #[error("trace mode not supported")]
    NotSupported,

    /// Unrecognized control command.
    #[error("unknown control request {0:#x}")]
    UnknownRequest(u32),
}

pub type Result<T> = core::result::Result<T, Error>;
