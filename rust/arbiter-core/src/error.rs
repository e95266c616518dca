// rust/arbiter-core/src/error.rs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArbiterError {

    #[error("I/O error while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode control record: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Malformed control message: {message}")]
    MalformedMessage {
        message: String,
    },

    #[error("Short payload read: expected {expected} bytes, received {received}")]
    ShortRead {
        expected: u64,
        received: u64,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job '{job_id}' was not granted the link within {waited:?}")]
    GrantTimeout {
        job_id: String,
        waited: Duration,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
    },

    #[error("Workload error: {message}")]
    Workload {
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ArbiterError>;

// Convenience constructors
impl ArbiterError {

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            source: None,
        }
    }

    pub fn decode_with_source(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn short_read(expected: u64, received: u64) -> Self {
        Self::ShortRead { expected, received }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn connect(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    pub fn grant_timeout(job_id: impl Into<String>, waited: Duration) -> Self {
        Self::GrantTimeout {
            job_id: job_id.into(),
            waited,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn workload(message: impl Into<String>) -> Self {
        Self::Workload {
            message: message.into(),
        }
    }

    /// True for failures that mean "the peer is gone or spoke garbage",
    /// which every connection loop treats as a disconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Decode { .. }
                | Self::MalformedMessage { .. }
                | Self::ShortRead { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = ArbiterError::short_read(10, 4);
        assert_eq!(
            err.to_string(),
            "Short payload read: expected 10 bytes, received 4"
        );

        let err = ArbiterError::grant_timeout("job-a", Duration::from_secs(2));
        assert!(err.to_string().contains("job-a"));
    }

    #[test]
    fn test_is_disconnect() {
        assert!(ArbiterError::short_read(1, 0).is_disconnect());
        assert!(ArbiterError::decode("bad").is_disconnect());
        assert!(ArbiterError::malformed("missing comm_time").is_disconnect());
        assert!(!ArbiterError::config("bad beta").is_disconnect());
        assert!(!ArbiterError::grant_timeout("x", Duration::ZERO).is_disconnect());
    }
}
