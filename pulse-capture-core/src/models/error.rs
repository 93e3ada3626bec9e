use thiserror::Error;

/// Error codes reported by the audio-server client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorCode {
    AccessDenied,
    CommandUnknown,
    InvalidArgument,
    EntityExists,
    NoSuchEntity,
    ConnectionRefused,
    Protocol,
    Timeout,
    NoAuthKey,
    Internal,
    ConnectionTerminated,
    Killed,
    InvalidServer,
    ModuleInitFailed,
    BadState,
    NoData,
    Version,
    TooLarge,
    NotSupported,
    Unknown,
}

impl ServerErrorCode {
    /// Human-readable description of the code.
    pub fn describe(self) -> &'static str {
        match self {
            Self::AccessDenied => "Access denied",
            Self::CommandUnknown => "Unknown command",
            Self::InvalidArgument => "Invalid argument",
            Self::EntityExists => "Entity exists",
            Self::NoSuchEntity => "No such entity",
            Self::ConnectionRefused => "Connection refused",
            Self::Protocol => "Protocol error",
            Self::Timeout => "Timeout",
            Self::NoAuthKey => "No authentication key",
            Self::Internal => "Internal error",
            Self::ConnectionTerminated => "Connection terminated",
            Self::Killed => "Entity killed",
            Self::InvalidServer => "Invalid server",
            Self::ModuleInitFailed => "Module initialization failed",
            Self::BadState => "Bad state",
            Self::NoData => "No data",
            Self::Version => "Incompatible protocol version",
            Self::TooLarge => "Too large",
            Self::NotSupported => "Not supported",
            Self::Unknown => "Unknown error code",
        }
    }
}

/// An error reported by the audio-server client library.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", code.describe())]
pub struct ServerError {
    pub code: ServerErrorCode,
}

impl ServerError {
    pub fn new(code: ServerErrorCode) -> Self {
        Self { code }
    }
}

impl From<ServerErrorCode> for ServerError {
    fn from(code: ServerErrorCode) -> Self {
        Self::new(code)
    }
}

/// Errors that can occur while sharing the event loop or capturing audio.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("event loop unavailable: {0}")]
    LoopUnavailable(String),

    #[error("audio server connection failure ({identity}): {source}")]
    ConnectionFailed { identity: String, source: ServerError },

    #[error("cannot connect record stream: {0}")]
    StreamConnectionFailed(ServerError),

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("unsupported")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_displays_code_description() {
        let err = ServerError::new(ServerErrorCode::ConnectionRefused);
        assert_eq!(err.to_string(), "Connection refused");
    }

    #[test]
    fn connection_failure_names_identity_and_cause() {
        let err = CaptureError::ConnectionFailed {
            identity: "recorder".into(),
            source: ServerErrorCode::AccessDenied.into(),
        };
        assert_eq!(
            err.to_string(),
            "audio server connection failure (recorder): Access denied"
        );
    }
}
