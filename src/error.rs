use thiserror::Error;


/// Coarse classification of session failures, used by the supervisor to decide how to recover
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// no reply or a failed socket operation; reconnect right away
    Transient,
    /// a damaged message that could not be skipped
    Integrity,
    /// the peer violated the protocol; the session is unusable and reconnecting needs a back-off
    Protocol,
    /// the device could not be found locally or through the P2P relays
    Discovery,
    /// retrying cannot help, e.g. an invalid configuration
    Fatal,
    /// the session was asked to stop
    Stopped,
}

#[derive(Debug, Error)]
pub enum BaichuanError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("unknown message class {0:#06x}")]
    UnknownMessageClass(u16),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("no P2P relay host answered")]
    RelayExhausted,
    #[error("device {0} could not be reached")]
    Unreachable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("session stopped")]
    Stopped,
}

impl BaichuanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BaichuanError::Timeout(_) | BaichuanError::Io(_) => ErrorKind::Transient,
            BaichuanError::Integrity(_) => ErrorKind::Integrity,
            BaichuanError::UnknownMessageClass(_) | BaichuanError::Protocol(_) => ErrorKind::Protocol,
            BaichuanError::RelayExhausted | BaichuanError::Unreachable(_) => ErrorKind::Discovery,
            BaichuanError::InvalidConfig(_) => ErrorKind::Fatal,
            BaichuanError::Stopped => ErrorKind::Stopped,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(BaichuanError::Timeout("reply"), ErrorKind::Transient)]
    #[case::io(BaichuanError::Io(std::io::Error::other("x")), ErrorKind::Transient)]
    #[case::integrity(BaichuanError::Integrity("checksum".to_string()), ErrorKind::Integrity)]
    #[case::message_class(BaichuanError::UnknownMessageClass(0x1234), ErrorKind::Protocol)]
    #[case::relays(BaichuanError::RelayExhausted, ErrorKind::Discovery)]
    #[case::unreachable(BaichuanError::Unreachable("uid".to_string()), ErrorKind::Discovery)]
    #[case::config(BaichuanError::InvalidConfig("x".to_string()), ErrorKind::Fatal)]
    #[case::stopped(BaichuanError::Stopped, ErrorKind::Stopped)]
    fn test_kind(#[case] error: BaichuanError, #[case] expected: ErrorKind) {
        assert_eq!(error.kind(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(BaichuanError::UnknownMessageClass(0x6415).to_string(), "unknown message class 0x6415");
    }
}
