//! Error taxonomy for the WebSocket protocol.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Broad classes of protocol failures.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    Protocol,
    Validation,
    Internal,
}

/// Concrete error codes carried in error frames.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum WsErrorCode {
    UnknownOpcode = 1000,
    MalformedMessage = 1001,
    HandshakeRequired = 1002,
    HandshakeAlreadyCompleted = 1003,
    UnsupportedProtocolVersion = 1004,
    InvalidRequestId = 1005,
    TooManyPendingRequests = 1006,
    InvalidParams = 1007,
    NotImplemented = 1008,
    InternalError = 1009,
}

impl WsErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownOpcode
            | Self::MalformedMessage
            | Self::HandshakeRequired
            | Self::HandshakeAlreadyCompleted => ErrorKind::Protocol,
            Self::UnsupportedProtocolVersion
            | Self::InvalidRequestId
            | Self::TooManyPendingRequests
            | Self::InvalidParams => ErrorKind::Validation,
            Self::NotImplemented | Self::InternalError => ErrorKind::Internal,
        }
    }

    /// Whether the connection is closed (policy code 1008) after the
    /// error frame is sent.
    pub fn should_terminate(&self) -> bool {
        matches!(
            self,
            Self::UnknownOpcode | Self::MalformedMessage | Self::HandshakeRequired
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::UnknownOpcode => "unknown opcode",
            Self::MalformedMessage => "malformed message",
            Self::HandshakeRequired => "handshake required",
            Self::HandshakeAlreadyCompleted => "handshake already completed",
            Self::UnsupportedProtocolVersion => "unsupported protocol version",
            Self::InvalidRequestId => "invalid request id",
            Self::TooManyPendingRequests => "too many pending requests",
            Self::InvalidParams => "invalid params",
            Self::NotImplemented => "not implemented",
            Self::InternalError => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(WsErrorCode::UnknownOpcode.kind(), ErrorKind::Protocol);
        assert_eq!(WsErrorCode::InvalidParams.kind(), ErrorKind::Validation);
        assert_eq!(WsErrorCode::InternalError.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_termination_policy() {
        assert!(WsErrorCode::HandshakeRequired.should_terminate());
        assert!(WsErrorCode::MalformedMessage.should_terminate());
        assert!(!WsErrorCode::TooManyPendingRequests.should_terminate());
        assert!(!WsErrorCode::InvalidRequestId.should_terminate());
    }
}
