use thiserror::Error;

/// Reasons a captured frame could not be turned into a [`DecodedPacket`].
///
/// A decode fault only ever skips the offending packet; capture continues.
///
/// [`DecodedPacket`]: crate::core::DecodedPacket
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFault {
    #[error("no IP layer found in packet")]
    MissingIpLayer,

    #[error("packet truncated: {0}")]
    Truncated(String),

    #[error("malformed DNS payload")]
    MalformedDns,

    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(u32),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("decode fault: {0}")]
    Decode(#[from] DecodeFault),

    #[error("invalid network '{value}': {reason}")]
    InvalidNetwork { value: String, reason: String },

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("event pipeline closed")]
    PipelineClosed,

    #[error("capture error: {0}")]
    Capture(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Whether the error only affects the current packet.
    pub fn is_decode_fault(&self) -> bool {
        matches!(self, FlowError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
