use serde::{Deserialize, Serialize};
use std::fmt;

/// Result code carried in the header of a server data message.
///
/// Only the codes the client reasons about get names; anything else is
/// passed through to the caller untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultCode(pub i32);

impl ResultCode {
    /// Client-side: the node exceeded its error budget for this window.
    pub const MAX_ERROR_RATE: ResultCode = ResultCode(-12);
    pub const OK: ResultCode = ResultCode(0);
    pub const SERVER_ERROR: ResultCode = ResultCode(1);
    pub const RECORD_NOT_FOUND: ResultCode = ResultCode(2);
    pub const GENERATION_ERROR: ResultCode = ResultCode(3);
    pub const PARAMETER_ERROR: ResultCode = ResultCode(4);
    pub const RECORD_EXISTS: ResultCode = ResultCode(5);
    pub const CLUSTER_CHANGE: ResultCode = ResultCode(7);
    pub const SERVER_FULL: ResultCode = ResultCode(8);
    pub const SERVER_TIMEOUT: ResultCode = ResultCode(9);
    pub const PARTITION_UNAVAILABLE: ResultCode = ResultCode(11);
    pub const RECORD_BUSY: ResultCode = ResultCode(14);
    pub const SCAN_ABORTED: ResultCode = ResultCode(15);
    pub const DEVICE_OVERLOAD: ResultCode = ResultCode(18);
    pub const NAMESPACE_NOT_FOUND: ResultCode = ResultCode(20);
    pub const INVALID_COMMAND: ResultCode = ResultCode(54);
    pub const INVALID_FIELD: ResultCode = ResultCode(55);
    pub const INVALID_USER: ResultCode = ResultCode(60);
    pub const INVALID_PASSWORD: ResultCode = ResultCode(62);
    pub const EXPIRED_PASSWORD: ResultCode = ResultCode(63);
    pub const INVALID_CREDENTIAL: ResultCode = ResultCode(65);
    pub const EXPIRED_SESSION: ResultCode = ResultCode(66);
    pub const NOT_AUTHENTICATED: ResultCode = ResultCode(80);
    pub const ROLE_VIOLATION: ResultCode = ResultCode(81);

    /// Retryable server conditions: overload and cluster reshuffles.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ResultCode::MAX_ERROR_RATE
                | ResultCode::CLUSTER_CHANGE
                | ResultCode::PARTITION_UNAVAILABLE
                | ResultCode::RECORD_BUSY
                | ResultCode::DEVICE_OVERLOAD
        )
    }

    /// Codes that end a command immediately: malformed requests and
    /// authentication failures.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ResultCode::PARAMETER_ERROR
                | ResultCode::INVALID_COMMAND
                | ResultCode::INVALID_FIELD
                | ResultCode::INVALID_USER
                | ResultCode::INVALID_PASSWORD
                | ResultCode::EXPIRED_PASSWORD
                | ResultCode::INVALID_CREDENTIAL
                | ResultCode::EXPIRED_SESSION
                | ResultCode::NOT_AUTHENTICATED
                | ResultCode::ROLE_VIOLATION
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultCode::MAX_ERROR_RATE => "max error rate exceeded",
            ResultCode::OK => "ok",
            ResultCode::SERVER_ERROR => "server error",
            ResultCode::RECORD_NOT_FOUND => "record not found",
            ResultCode::GENERATION_ERROR => "generation error",
            ResultCode::PARAMETER_ERROR => "parameter error",
            ResultCode::RECORD_EXISTS => "record exists",
            ResultCode::CLUSTER_CHANGE => "cluster change",
            ResultCode::SERVER_FULL => "server full",
            ResultCode::SERVER_TIMEOUT => "server timeout",
            ResultCode::PARTITION_UNAVAILABLE => "partition unavailable",
            ResultCode::RECORD_BUSY => "record busy",
            ResultCode::SCAN_ABORTED => "scan aborted",
            ResultCode::DEVICE_OVERLOAD => "device overload",
            ResultCode::NAMESPACE_NOT_FOUND => "namespace not found",
            ResultCode::INVALID_COMMAND => "invalid command",
            ResultCode::INVALID_FIELD => "invalid field",
            ResultCode::INVALID_USER => "invalid user",
            ResultCode::INVALID_PASSWORD => "invalid password",
            ResultCode::EXPIRED_PASSWORD => "expired password",
            ResultCode::INVALID_CREDENTIAL => "invalid credential",
            ResultCode::EXPIRED_SESSION => "expired session",
            ResultCode::NOT_AUTHENTICATED => "not authenticated",
            ResultCode::ROLE_VIOLATION => "role violation",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

impl From<u8> for ResultCode {
    fn from(code: u8) -> Self {
        ResultCode(code as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_is_disjoint() {
        for code in 0..=255u8 {
            let code = ResultCode::from(code);
            assert!(!(code.is_transient() && code.is_fatal()), "{}", code);
        }
    }

    #[test]
    fn test_overload_is_transient() {
        assert!(ResultCode::DEVICE_OVERLOAD.is_transient());
        assert!(ResultCode::CLUSTER_CHANGE.is_transient());
        assert!(!ResultCode::RECORD_NOT_FOUND.is_transient());
        assert!(ResultCode::NOT_AUTHENTICATED.is_fatal());
    }

    #[test]
    fn test_display_includes_name() {
        assert_eq!(ResultCode::RECORD_NOT_FOUND.to_string(), "2 (record not found)");
        assert_eq!(ResultCode(199).to_string(), "199 (unknown)");
    }
}
