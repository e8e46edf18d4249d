//! Error type shared by every bridge component.

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Operation attempted on a disposed, stale or never-initialized handle.
    #[error("invalid handle: {0:#018x}")]
    InvalidHandle(u64),
    /// Destination or source buffer is smaller than the format requires.
    #[error("insufficient buffer size [has {has}, need {need}]")]
    InsufficientBuffer {
        /// Bytes actually available.
        has: usize,
        /// Bytes required by the format.
        need: usize,
    },
    /// Pixel or sample format the bridge cannot express.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Codec name or parameter set without an underlying implementation.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    /// Query for an interface the object does not implement.
    #[error("interface not supported: {0}")]
    NotSupported(&'static str),
    /// An operating-system media or device call failed.
    #[error("{api} failed: {message}")]
    Platform {
        /// Name of the failing platform call.
        api: &'static str,
        /// Human readable failure detail.
        message: String,
    },
    /// Release called on an object whose count already reached zero.
    #[error("reference released more often than retained")]
    AlreadyReleased,
    /// Access to an object after its final release.
    #[error("object used after its final release")]
    UseAfterRelease,
    /// Callback entry point could not be resolved at registration time.
    #[error("callback setup failed: {0}")]
    Setup(String),
    /// A managed callback raised an exception.
    #[error("managed callback raised: {0}")]
    Managed(String),
    /// Frame delivered to a source that already ended.
    #[error("media source has ended")]
    SourceEnded,
    /// Caller supplied a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BridgeError {
    pub(crate) fn platform(api: &'static str, message: impl Into<String>) -> Self {
        Self::Platform {
            api,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Negative status returned by C entry points failing with this error.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidHandle(_) => -1,
            Self::InsufficientBuffer { .. } => -2,
            Self::InvalidArgument(_) => -3,
            Self::UnsupportedFormat(_) | Self::UnsupportedCodec(_) | Self::NotSupported(_) => -4,
            Self::Platform { .. } => -5,
            Self::AlreadyReleased | Self::UseAfterRelease => -6,
            Self::Setup(_) | Self::Managed(_) => -7,
            Self::SourceEnded => -8,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
