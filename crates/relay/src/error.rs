use axum::extract::ws::{close_code, CloseFrame};

/// RFC 6455 caps close reasons at 123 bytes.
const MAX_CLOSE_REASON_BYTES: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    HandshakeMissingDocument,
    HandshakeMissingPeer,
    AuthForbidden,
    AccessLookupFailed,
    FrameTooLarge,
    HeartbeatTimeout,
    ShuttingDown,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeMissingDocument => "HANDSHAKE_MISSING_DOCUMENT",
            Self::HandshakeMissingPeer => "HANDSHAKE_MISSING_PEER",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::AccessLookupFailed => "ACCESS_LOOKUP_FAILED",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    pub const fn close_code(self) -> u16 {
        match self {
            Self::HandshakeMissingDocument => close_code::POLICY,
            Self::HandshakeMissingPeer => close_code::POLICY,
            Self::AuthForbidden => close_code::POLICY,
            Self::AccessLookupFailed => close_code::ERROR,
            Self::FrameTooLarge => close_code::SIZE,
            Self::HeartbeatTimeout => close_code::POLICY,
            Self::ShuttingDown => close_code::AWAY,
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::HandshakeMissingDocument => "docId query parameter is required",
            Self::HandshakeMissingPeer => "userId query parameter is required",
            Self::AuthForbidden => "peer lacks access to the document",
            Self::AccessLookupFailed => "document access lookup failed",
            Self::FrameTooLarge => "websocket frame exceeds maximum size",
            Self::HeartbeatTimeout => "no pong received within heartbeat timeout",
            Self::ShuttingDown => "relay is shutting down",
        }
    }
}

/// Reason a socket is being closed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Close frame carrying `CODE: message`, trimmed to the protocol limit.
    pub fn close_frame(&self) -> CloseFrame {
        let reason = truncate_reason(format!("{}: {}", self.code.as_str(), self.message));
        CloseFrame { code: self.code.close_code(), reason: reason.into() }
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut cut = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    reason.truncate(cut);
    reason
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::close_code;

    use super::{ErrorCode, RelayError, MAX_CLOSE_REASON_BYTES};

    #[test]
    fn handshake_rejections_use_policy_close_code() {
        for code in [
            ErrorCode::HandshakeMissingDocument,
            ErrorCode::HandshakeMissingPeer,
            ErrorCode::AuthForbidden,
        ] {
            assert_eq!(code.close_code(), close_code::POLICY);
        }
        assert_eq!(ErrorCode::AccessLookupFailed.close_code(), close_code::ERROR);
        assert_eq!(ErrorCode::FrameTooLarge.close_code(), close_code::SIZE);
    }

    #[test]
    fn close_frame_carries_code_and_message() {
        let frame = RelayError::from_code(ErrorCode::AuthForbidden).close_frame();
        assert_eq!(frame.code, close_code::POLICY);
        assert_eq!(frame.reason.as_str(), "AUTH_FORBIDDEN: peer lacks access to the document");
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let frame = RelayError::new(ErrorCode::AuthForbidden, "é".repeat(200)).close_frame();
        assert!(frame.reason.as_str().len() <= MAX_CLOSE_REASON_BYTES);
        assert!(frame.reason.as_str().starts_with("AUTH_FORBIDDEN: é"));
    }
}
