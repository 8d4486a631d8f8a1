use std::fmt;

use serde::{Deserialize, Serialize};

/// A SIP response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u16);

/// Coarse classification of a status code per RFC 3261 §7.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// 1xx
    Provisional,
    /// 2xx
    Success,
    /// 3xx
    Redirection,
    /// 4xx
    ClientError,
    /// 5xx
    ServerError,
    /// 6xx
    GlobalFailure,
}

impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const RINGING: StatusCode = StatusCode(180);
    pub const SESSION_PROGRESS: StatusCode = StatusCode(183);
    pub const OK: StatusCode = StatusCode(200);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const MOVED_TEMPORARILY: StatusCode = StatusCode(302);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const TRANSACTION_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    pub const SERVER_INTERNAL_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// The classification of this code.
    pub fn kind(&self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirection,
            400..=499 => CodeKind::ClientError,
            500..=599 => CodeKind::ServerError,
            _ => CodeKind::GlobalFailure,
        }
    }

    /// `true` for 1xx.
    pub fn is_provisional(&self) -> bool {
        self.kind() == CodeKind::Provisional
    }

    /// `true` for 2xx.
    pub fn is_success(&self) -> bool {
        self.kind() == CodeKind::Success
    }

    /// `true` for 2xx-6xx.
    pub fn is_final(&self) -> bool {
        !self.is_provisional()
    }

    /// The numeric code.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// The default reason phrase for this code.
    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            302 => "Moved Temporarily",
            400 => "Bad Request",
            404 => "Not Found",
            408 => "Request Timeout",
            481 => "Call/Transaction Does Not Exist",
            486 => "Busy Here",
            487 => "Request Terminated",
            500 => "Server Internal Error",
            503 => "Service Unavailable",
            _ => match self.kind() {
                CodeKind::Provisional => "Provisional",
                CodeKind::Success => "Success",
                CodeKind::Redirection => "Redirection",
                CodeKind::ClientError => "Client Error",
                CodeKind::ServerError => "Server Error",
                CodeKind::GlobalFailure => "Global Failure",
            },
        }
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        assert_eq!(StatusCode::TRYING.kind(), CodeKind::Provisional);
        assert_eq!(StatusCode::OK.kind(), CodeKind::Success);
        assert_eq!(StatusCode::BUSY_HERE.kind(), CodeKind::ClientError);
        assert!(StatusCode(603).is_final());
        assert!(!StatusCode::RINGING.is_final());
    }
}
