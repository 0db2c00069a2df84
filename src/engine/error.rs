use std::{error, fmt};

/// The small set of structured failures the engine can report. Mapping
/// these to beanstalkd wire keywords is the protocol layer's job, not the
/// engine's (§7 propagation policy).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EngineError {
    /// Unknown job/tube id, or a precondition the command family requires
    /// (caller is the reserver, job is in a kickable state, etc.) wasn't
    /// met.
    NotFound,
    /// `ignore` would leave the session watching nothing.
    NotIgnored,
    /// `put` while the server is in drain mode.
    Draining,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NotIgnored => write!(f, "not ignored"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

impl error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;
