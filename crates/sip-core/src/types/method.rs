//! SIP request methods (RFC 3261 and extensions)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A SIP request method.
///
/// The common methods a softphone exchanges are represented directly;
/// anything else is carried as [`Method::Extension`] so unrecognised
/// requests can still be answered (typically with 501).
///
/// # Examples
///
/// ```rust
/// use softline_sip_core::Method;
///
/// let m: Method = "INVITE".parse().unwrap();
/// assert_eq!(m, Method::Invite);
/// assert_eq!(m.to_string(), "INVITE");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Subscribe,
    Notify,
    Refer,
    Info,
    Message,
    Update,
    Prack,
    /// Any method this stack does not interpret.
    Extension(String),
}

impl Method {
    /// Canonical wire spelling of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Extension(s) => s.as_str(),
        }
    }

    /// Whether a request with this method creates a dialog.
    pub fn creates_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Refer)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            other => Method::Extension(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_methods() {
        assert_eq!("register".parse::<Method>().unwrap(), Method::Register);
        assert_eq!("NOTIFY".parse::<Method>().unwrap(), Method::Notify);
    }

    #[test]
    fn unknown_method_round_trips() {
        let m: Method = "PUBLISH".parse().unwrap();
        assert_eq!(m, Method::Extension("PUBLISH".to_string()));
        assert_eq!(m.as_str(), "PUBLISH");
    }

    #[test]
    fn dialog_creating_methods() {
        assert!(Method::Invite.creates_dialog());
        assert!(Method::Subscribe.creates_dialog());
        assert!(!Method::Register.creates_dialog());
    }
}
