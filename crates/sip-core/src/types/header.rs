//! Header names, the ordered header map, and typed header values

use crate::error::{Error, Result};
use crate::types::address::Address;
use crate::types::method::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A SIP header name.
///
/// Compact forms are folded into their long equivalents at parse time, so
/// `i: abc` and `Call-ID: abc` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    MaxForwards,
    Expires,
    MinExpires,
    ContentType,
    ContentLength,
    Event,
    SubscriptionState,
    Accept,
    Allow,
    AllowEvents,
    Supported,
    UserAgent,
    ReferTo,
    ReferredBy,
    Replaces,
    Authorization,
    WwwAuthenticate,
    ProxyAuthenticate,
    ProxyAuthorization,
    Route,
    RecordRoute,
    RetryAfter,
    Reason,
    Other(String),
}

impl HeaderName {
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Expires => "Expires",
            HeaderName::MinExpires => "Min-Expires",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Event => "Event",
            HeaderName::SubscriptionState => "Subscription-State",
            HeaderName::Accept => "Accept",
            HeaderName::Allow => "Allow",
            HeaderName::AllowEvents => "Allow-Events",
            HeaderName::Supported => "Supported",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::ReferTo => "Refer-To",
            HeaderName::ReferredBy => "Referred-By",
            HeaderName::Replaces => "Replaces",
            HeaderName::Authorization => "Authorization",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::RetryAfter => "Retry-After",
            HeaderName::Reason => "Reason",
            HeaderName::Other(s) => s.as_str(),
        }
    }
}

impl FromStr for HeaderName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Ok(match lower.as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" | "m" => HeaderName::Contact,
            "max-forwards" => HeaderName::MaxForwards,
            "expires" => HeaderName::Expires,
            "min-expires" => HeaderName::MinExpires,
            "content-type" | "c" => HeaderName::ContentType,
            "content-length" | "l" => HeaderName::ContentLength,
            "event" | "o" => HeaderName::Event,
            "subscription-state" => HeaderName::SubscriptionState,
            "accept" => HeaderName::Accept,
            "allow" => HeaderName::Allow,
            "allow-events" | "u" => HeaderName::AllowEvents,
            "supported" | "k" => HeaderName::Supported,
            "user-agent" => HeaderName::UserAgent,
            "refer-to" | "r" => HeaderName::ReferTo,
            "referred-by" | "b" => HeaderName::ReferredBy,
            "replaces" => HeaderName::Replaces,
            "authorization" => HeaderName::Authorization,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "retry-after" => HeaderName::RetryAfter,
            "reason" => HeaderName::Reason,
            _ => HeaderName::Other(s.trim().to_string()),
        })
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One header line: name plus raw value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: HeaderName,
    pub value: String,
}

impl Header {
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        Header {
            name,
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// The ordered header collection of a message.
///
/// Preserves insertion order and duplicates (Via, Route and Contact may
/// legitimately repeat); typed accessors parse on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Replace all occurrences of `name` with a single header.
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.retain(|h| h.name != name);
        self.0.push(Header::new(name, value));
    }

    pub fn remove(&mut self, name: &HeaderName) {
        self.0.retain(|h| &h.name != name);
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.0.iter().any(|h| &h.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Typed accessors.

    pub fn call_id(&self) -> Option<&str> {
        self.get(&HeaderName::CallId)
    }

    pub fn cseq(&self) -> Result<CSeq> {
        let raw = self.get(&HeaderName::CSeq).ok_or(Error::MissingHeader {
            name: "CSeq".to_string(),
        })?;
        raw.parse()
    }

    pub fn from_address(&self) -> Result<Address> {
        let raw = self.get(&HeaderName::From).ok_or(Error::MissingHeader {
            name: "From".to_string(),
        })?;
        raw.parse()
    }

    pub fn to_address(&self) -> Result<Address> {
        let raw = self.get(&HeaderName::To).ok_or(Error::MissingHeader {
            name: "To".to_string(),
        })?;
        raw.parse()
    }

    pub fn contact_address(&self) -> Option<Address> {
        self.get(&HeaderName::Contact).and_then(|v| v.parse().ok())
    }

    pub fn expires(&self) -> Option<u32> {
        self.get(&HeaderName::Expires)
            .and_then(|v| v.trim().parse().ok())
    }

    /// The event package of an Event header, without parameters.
    pub fn event_package(&self) -> Option<&str> {
        self.get(&HeaderName::Event)
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// Content-Type, lowercased, without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.get(&HeaderName::ContentType)
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get(&HeaderName::ContentLength)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Subscription-State value and the leading state token.
    pub fn subscription_state(&self) -> Option<&str> {
        self.get(&HeaderName::SubscriptionState)
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }
}

/// A parsed CSeq header: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split_whitespace();
        let seq = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| Error::InvalidHeader {
                name: "CSeq".to_string(),
                value: s.to_string(),
            })?;
        let method_str = parts.next().ok_or_else(|| Error::InvalidHeader {
            name: "CSeq".to_string(),
            value: s.to_string(),
        })?;
        let method = Method::from_str(method_str).unwrap_or(Method::Extension(method_str.to_string()));
        Ok(CSeq { seq, method })
    }
}
