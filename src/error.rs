//! Error types for the Lark gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or control message on the transport
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio frame size or format mismatch
    #[error("codec error: {0}")]
    Codec(String),

    /// A capability provider call failed or timed out
    #[error("capability error: {0}")]
    Capability(String),

    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// A tool call failed during execution
    #[error("tool error: {0}")]
    Tool(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable machine-readable code sent to clients in `error` control messages
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::Codec(_) => "codec_error",
            Self::Capability(_) | Self::Http(_) => "capability_error",
            Self::Config(_) | Self::Toml(_) => "configuration_error",
            Self::Tool(_) => "tool_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::Protocol("x".into()).code(), "protocol_error");
        assert_eq!(Error::Codec("x".into()).code(), "codec_error");
        assert_eq!(Error::Capability("x".into()).code(), "capability_error");
        assert_eq!(Error::Config("x".into()).code(), "configuration_error");
        assert_eq!(Error::Tool("x".into()).code(), "tool_error");
    }
}
