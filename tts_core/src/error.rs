//! Error types for the synthesis pipeline and the wire framing.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single synthesis request.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("no synthesizable text after segmentation")]
    EmptyInput,

    #[error("synthesis failed for unit {ordinal}: {message}")]
    Synthesis { ordinal: usize, message: String },

    #[error("encoder failed: {message}{}", stderr_suffix(.stderr))]
    Encoding { message: String, stderr: String },

    #[error("{stage} timed out after {}s", .after.as_secs_f32())]
    Timeout { stage: &'static str, after: Duration },

    #[error("client disconnected")]
    ClientDisconnected,
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" (stderr: {trimmed})")
    }
}

impl PipelineError {
    pub fn synthesis(ordinal: usize, message: impl Into<String>) -> Self {
        Self::Synthesis {
            ordinal,
            message: message.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
            stderr: String::new(),
        }
    }

    /// Machine-readable category, stable across releases.
    pub fn category(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::Synthesis { .. } => "synthesis",
            Self::Encoding { .. } => "encoding",
            Self::Timeout { .. } => "timeout",
            Self::ClientDisconnected => "client_disconnected",
        }
    }

    /// A disconnect ends the request but is not a fault of the service.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ClientDisconnected)
    }
}

/// Failure while reading wire frames back.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame length {0} exceeds limit")]
    TooLarge(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
