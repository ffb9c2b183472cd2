//! HTTP/3 error codes per RFC 9114 Section 8.1 and the error type built on
//! them.

use std::fmt;
use thiserror::Error;

/// HTTP/3 error codes (RFC 9114 Section 8.1).
///
/// These travel inside QUIC application close / RESET_STREAM /
/// STOP_SENDING frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    /// H3_NO_ERROR: graceful close with nothing to signal.
    NoError = 0x0100,
    /// H3_GENERAL_PROTOCOL_ERROR: violation without a more specific code.
    GeneralProtocolError = 0x0101,
    /// H3_INTERNAL_ERROR: failure inside the HTTP stack.
    InternalError = 0x0102,
    /// H3_STREAM_CREATION_ERROR: peer created a stream we will not accept.
    StreamCreationError = 0x0103,
    /// H3_CLOSED_CRITICAL_STREAM: a required stream was closed or reset.
    ClosedCriticalStream = 0x0104,
    /// H3_FRAME_UNEXPECTED: frame not permitted in the current state.
    FrameUnexpected = 0x0105,
    /// H3_FRAME_ERROR: frame violating layout or size rules.
    FrameError = 0x0106,
    /// H3_EXCESSIVE_LOAD: peer behavior generating excessive load.
    ExcessiveLoad = 0x0107,
    /// H3_ID_ERROR: stream or push ID misuse.
    IdError = 0x0108,
    /// H3_SETTINGS_ERROR: invalid SETTINGS payload.
    SettingsError = 0x0109,
    /// H3_MISSING_SETTINGS: control stream did not start with SETTINGS.
    MissingSettings = 0x010a,
    /// H3_REQUEST_REJECTED: rejected without application processing.
    RequestRejected = 0x010b,
    /// H3_REQUEST_CANCELLED: request or response cancelled.
    RequestCancelled = 0x010c,
    /// H3_REQUEST_INCOMPLETE: stream ended without a full request.
    RequestIncomplete = 0x010d,
    /// H3_MESSAGE_ERROR: malformed HTTP message.
    MessageError = 0x010e,
    /// H3_CONNECT_ERROR: CONNECT target reset or closed abnormally.
    ConnectError = 0x010f,
    /// H3_VERSION_FALLBACK: retry over HTTP/1.1.
    VersionFallback = 0x0110,
    /// QPACK_DECOMPRESSION_FAILED (RFC 9204 Section 6).
    QpackDecompressionFailed = 0x0200,
    /// QPACK_ENCODER_STREAM_ERROR (RFC 9204 Section 6).
    QpackEncoderStreamError = 0x0201,
    /// QPACK_DECODER_STREAM_ERROR (RFC 9204 Section 6).
    QpackDecoderStreamError = 0x0202,
}

impl ErrorCode {
    pub fn to_code(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "H3_NO_ERROR",
            Self::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            Self::InternalError => "H3_INTERNAL_ERROR",
            Self::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            Self::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            Self::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            Self::FrameError => "H3_FRAME_ERROR",
            Self::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            Self::IdError => "H3_ID_ERROR",
            Self::SettingsError => "H3_SETTINGS_ERROR",
            Self::MissingSettings => "H3_MISSING_SETTINGS",
            Self::RequestRejected => "H3_REQUEST_REJECTED",
            Self::RequestCancelled => "H3_REQUEST_CANCELLED",
            Self::RequestIncomplete => "H3_REQUEST_INCOMPLETE",
            Self::MessageError => "H3_MESSAGE_ERROR",
            Self::ConnectError => "H3_CONNECT_ERROR",
            Self::VersionFallback => "H3_VERSION_FALLBACK",
            Self::QpackDecompressionFailed => "H3_QPACK_DECOMPRESSION_FAILED",
            Self::QpackEncoderStreamError => "H3_QPACK_ENCODER_STREAM_ERROR",
            Self::QpackDecoderStreamError => "H3_QPACK_DECODER_STREAM_ERROR",
        };
        f.write_str(name)
    }
}

/// Result type for HTTP/3 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP/3 session error.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol violation carrying the code to put on the wire.
    #[error("{code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    /// QPACK failure; folded into the QPACK error-code space.
    #[error("qpack: {0}")]
    Qpack(#[from] qecho_qpack::QpackError),

    /// Operation referenced a stream the session does not know.
    #[error("unknown stream {0}")]
    UnknownStream(u64),
}

impl Error {
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// The QUIC application error code this error closes with, mirroring
    /// nghttp3's `err_infer_quic_app_error_code`.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Qpack(q) => match q {
                qecho_qpack::QpackError::EncoderStream(_) => ErrorCode::QpackEncoderStreamError,
                qecho_qpack::QpackError::DecoderStream(_) => ErrorCode::QpackDecoderStreamError,
                _ => ErrorCode::QpackDecompressionFailed,
            },
            Self::UnknownStream(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error tears down the whole connection rather than a
    /// single stream.
    pub fn is_connection_error(&self) -> bool {
        !matches!(
            self.to_error_code(),
            ErrorCode::NoError
                | ErrorCode::RequestRejected
                | ErrorCode::RequestCancelled
                | ErrorCode::RequestIncomplete
                | ErrorCode::MessageError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qpack_errors_map_to_qpack_codes() {
        let e = Error::from(qecho_qpack::QpackError::EncoderStream("bad".into()));
        assert_eq!(e.to_error_code(), ErrorCode::QpackEncoderStreamError);
        assert!(e.is_connection_error());

        let e = Error::from(qecho_qpack::QpackError::InvalidHuffman);
        assert_eq!(e.to_error_code(), ErrorCode::QpackDecompressionFailed);
    }

    #[test]
    fn message_errors_stay_stream_level() {
        let e = Error::protocol(ErrorCode::MessageError, "missing :method");
        assert!(!e.is_connection_error());
        let e = Error::protocol(ErrorCode::MissingSettings, "no SETTINGS");
        assert!(e.is_connection_error());
    }

    #[test]
    fn display_names() {
        assert_eq!(ErrorCode::NoError.to_string(), "H3_NO_ERROR");
        assert_eq!(ErrorCode::NoError.to_code(), 0x0100);
        assert_eq!(
            ErrorCode::QpackDecompressionFailed.to_string(),
            "H3_QPACK_DECOMPRESSION_FAILED"
        );
    }
}
