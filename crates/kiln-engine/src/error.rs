//! Error types for the execution engine.
//!
//! Every failure a caller can observe is an [`ExecError`]; the engine
//! classifies script-side failures into this taxonomy and never swallows
//! them. `code()` yields the canonical wire code for the envelope.

use thiserror::Error;

/// Errors produced while materializing builds and executing script calls.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failure materializing or compiling a build.
    #[error("{code}: {message}")]
    Build { code: u16, message: String },

    /// The requested class does not exist or is not session-enabled.
    #[error("No such class")]
    NoSuchClass,

    /// The requested function does not exist or is not call-enabled.
    #[error("No such method")]
    NoSuchMethod,

    /// Session lifecycle violation.
    #[error("{code}: {message}")]
    Session { code: u16, message: String },

    /// A script-side failure without a user-assigned code.
    #[error("{code}: {message}")]
    Execution {
        code: u16,
        message: String,
        stack: Option<String>,
    },

    /// A user-thrown error (`throw new Error(code, message)`); the code
    /// passes through to the caller.
    #[error("{code}: {message}")]
    Api { code: u16, message: String },

    /// The script was aborted by the interrupt handler (blocking JS or a
    /// host-requested termination). Surfaced to callers as a 408.
    #[error("script terminated")]
    Terminated,

    /// The worker's job queue is full.
    #[error("worker queue is full")]
    WorkerBusy,

    /// Internal plumbing failure (worker gone, channel dropped).
    #[error("engine error: {0}")]
    Engine(String),
}

impl ExecError {
    pub fn build(code: u16, message: impl Into<String>) -> Self {
        Self::Build {
            code,
            message: message.into(),
        }
    }

    pub fn session(code: u16, message: impl Into<String>) -> Self {
        Self::Session {
            code,
            message: message.into(),
        }
    }

    pub fn execution(code: u16, message: impl Into<String>) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            stack: None,
        }
    }

    pub fn api(code: u16, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Canonical envelope code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::Build { code, .. }
            | Self::Session { code, .. }
            | Self::Execution { code, .. }
            | Self::Api { code, .. } => *code,
            Self::NoSuchClass | Self::NoSuchMethod => 404,
            Self::Terminated => 408,
            Self::WorkerBusy | Self::Engine(_) => 500,
        }
    }

    /// Human-readable message for the envelope body.
    pub fn message(&self) -> String {
        match self {
            Self::Build { message, .. }
            | Self::Session { message, .. }
            | Self::Execution { message, .. }
            | Self::Api { message, .. } => message.clone(),
            Self::NoSuchClass => "No such class".to_string(),
            Self::NoSuchMethod => "No such method".to_string(),
            Self::Terminated => {
                "Evaluation process timeout: function shouldn't be blocking and should rely \
                 on async methods instead."
                    .to_string()
            }
            Self::WorkerBusy => "Worker queue is full".to_string(),
            Self::Engine(message) => message.clone(),
        }
    }

    /// Stack trace, when one was captured and the handler is in debug mode.
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Execution { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Collapse internal-only kinds into their caller-visible form.
    pub fn into_public(self) -> Self {
        match self {
            Self::Terminated => Self::Api {
                code: 408,
                message: Self::Terminated.message(),
            },
            Self::WorkerBusy => Self::Api {
                code: 500,
                message: Self::WorkerBusy.message(),
            },
            other => other,
        }
    }
}

/// Result type alias for engine operations.
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_codes() {
        assert_eq!(ExecError::NoSuchMethod.code(), 404);
        assert_eq!(ExecError::NoSuchClass.code(), 404);
        assert_eq!(ExecError::Terminated.code(), 408);
        assert_eq!(ExecError::WorkerBusy.code(), 500);
        assert_eq!(ExecError::api(409, "conflict").code(), 409);
        assert_eq!(ExecError::build(500, "boom").code(), 500);
    }

    #[test]
    fn terminated_becomes_408_api_error() {
        let err = ExecError::Terminated.into_public();
        match err {
            ExecError::Api { code, message } => {
                assert_eq!(code, 408);
                assert!(message.contains("shouldn't be blocking"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
