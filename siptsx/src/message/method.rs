use std::fmt;

use serde::{Deserialize, Serialize};
use util::ArcStr;

/// A SIP request method.
///
/// Methods compare case-insensitively on the wire; extension methods are
/// canonicalized to upper case on construction so derived equality and
/// hashing match RFC 3261 semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SipMethod {
    /// `INVITE`
    Invite,
    /// `ACK`
    Ack,
    /// `BYE`
    Bye,
    /// `CANCEL`
    Cancel,
    /// `OPTIONS`
    Options,
    /// `REGISTER`
    Register,
    /// `INFO`
    Info,
    /// `MESSAGE`
    Message,
    /// `SUBSCRIBE`
    Subscribe,
    /// `NOTIFY`
    Notify,
    /// `UPDATE`
    Update,
    /// `PRACK`
    Prack,
    /// `REFER`
    Refer,
    /// Any other method, stored canonicalized to upper case.
    Other(ArcStr),
}

impl SipMethod {
    /// Canonical upper-case name of the method.
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Info => "INFO",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Refer => "REFER",
            SipMethod::Other(name) => name,
        }
    }
}

impl From<&str> for SipMethod {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "OPTIONS" => SipMethod::Options,
            "REGISTER" => SipMethod::Register,
            "INFO" => SipMethod::Info,
            "MESSAGE" => SipMethod::Message,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "REFER" => SipMethod::Refer,
            other => SipMethod::Other(ArcStr::from(other)),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive() {
        assert_eq!(SipMethod::from("invite"), SipMethod::Invite);
        assert_eq!(SipMethod::from("Invite"), SipMethod::Invite);
        assert_eq!(SipMethod::from("publish"), SipMethod::from("PUBLISH"));
    }
}
