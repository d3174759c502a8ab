//! SIP URI parsing and formatting
//!
//! Covers the `sip:`/`sips:` subset a softphone builds and reads: userinfo,
//! host, port, URI parameters and embedded headers (the latter carry the
//! `Replaces` payload of an attended transfer's Refer-To target).

use crate::error::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while, take_while1},
    character::complete::char,
    combinator::opt,
    multi::{many0, separated_list0},
    sequence::{preceded, separated_pair, terminated},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// URI scheme, `sip` or `sips`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A parsed SIP URI.
///
/// # Examples
///
/// ```rust
/// use softline_sip_core::SipUri;
///
/// let uri: SipUri = "sip:2000@pbx.example.com:5060;transport=ws".parse().unwrap();
/// assert_eq!(uri.user.as_deref(), Some("2000"));
/// assert_eq!(uri.host, "pbx.example.com");
/// assert_eq!(uri.port, Some(5060));
/// assert_eq!(uri.param("transport"), Some("ws"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// URI parameters in order of appearance; a flag parameter has no value.
    pub params: Vec<(String, Option<String>)>,
    /// Embedded headers (`?name=value&...`), values kept URI-escaped.
    pub headers: Vec<(String, String)>,
}

impl SipUri {
    /// Build a plain `sip:user@host` URI.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        SipUri {
            scheme: Scheme::Sip,
            user: Some(user.into()),
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Build a host-only URI (used for registrar request URIs).
    pub fn domain(host: impl Into<String>) -> Self {
        SipUri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Look up a URI parameter value. Flag parameters return `None` even
    /// when present; use [`SipUri::has_param`] for those.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), Some(value.into())));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match parse_uri(s) {
            Ok(("", uri)) => Ok(uri),
            _ => Err(Error::InvalidUri {
                input: s.to_string(),
            }),
        }
    }
}

fn is_user_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()+%&=$,".contains(c)
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()+%".contains(c)
}

fn is_header_value_char(c: char) -> bool {
    c != '&' && c != ' ' && c != '>' && !c.is_control()
}

fn scheme(input: &str) -> IResult<&str, Scheme> {
    alt((
        nom::combinator::value(Scheme::Sips, tag_no_case("sips:")),
        nom::combinator::value(Scheme::Sip, tag_no_case("sip:")),
    ))(input)
}

fn userinfo(input: &str) -> IResult<&str, &str> {
    terminated(take_while1(is_user_char), char('@'))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    let (rest, digits) = preceded(char(':'), take_while1(|c: char| c.is_ascii_digit()))(input)?;
    match digits.parse::<u16>() {
        Ok(p) => Ok((rest, p)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

fn uri_param(input: &str) -> IResult<&str, (String, Option<String>)> {
    let (rest, name) = preceded(char(';'), take_while1(is_token_char))(input)?;
    let (rest, value) = opt(preceded(char('='), take_while1(is_token_char)))(rest)?;
    Ok((rest, (name.to_string(), value.map(|v| v.to_string()))))
}

fn uri_header(input: &str) -> IResult<&str, (String, String)> {
    let (rest, (name, value)) = separated_pair(
        take_while1(is_token_char),
        char('='),
        take_while(is_header_value_char),
    )(input)?;
    Ok((rest, (name.to_string(), value.to_string())))
}

fn parse_uri(input: &str) -> IResult<&str, SipUri> {
    let (rest, scheme) = scheme(input)?;
    let (rest, user) = opt(userinfo)(rest)?;
    let (rest, host) = take_while1(is_host_char)(rest)?;
    let (rest, port) = opt(port)(rest)?;
    let (rest, params) = many0(uri_param)(rest)?;
    let (rest, headers) = opt(preceded(
        char('?'),
        separated_list0(char('&'), uri_header),
    ))(rest)?;
    Ok((
        rest,
        SipUri {
            scheme,
            user: user.map(|u| u.to_string()),
            host: host.to_string(),
            port,
            params,
            headers: headers.unwrap_or_default(),
        },
    ))
}

/// Percent-escape a string for use inside a URI header value.
///
/// Used when embedding a `Replaces` parameter list in a Refer-To URI, where
/// the semicolons separating `to-tag`/`from-tag` must not terminate the URI.
pub fn escape_header_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'!' | b'*' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Reverse of [`escape_header_value`]; invalid escapes are kept verbatim.
pub fn unescape_header_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) =
                u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16)
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let uri: SipUri = "sip:pbx.example.com".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert!(uri.user.is_none());
        assert_eq!(uri.host, "pbx.example.com");
        assert!(uri.port.is_none());
    }

    #[test]
    fn parse_full() {
        let uri: SipUri = "sips:alice@pbx.example.com:5061;transport=ws;lr?Replaces=abc%3Bto-tag%3D1"
            .parse()
            .unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.param("transport"), Some("ws"));
        assert!(uri.has_param("lr"));
        assert_eq!(uri.headers.len(), 1);
        assert_eq!(uri.headers[0].0, "Replaces");
    }

    #[test]
    fn display_round_trip() {
        let s = "sip:2000@pbx.example.com:5060;transport=ws";
        let uri: SipUri = s.parse().unwrap();
        assert_eq!(uri.to_string(), s);
    }

    #[test]
    fn rejects_garbage() {
        assert!("http://example.com".parse::<SipUri>().is_err());
        assert!("sip:".parse::<SipUri>().is_err());
    }

    #[test]
    fn escaping_round_trip() {
        let raw = "call-123;to-tag=abc;from-tag=def";
        let escaped = escape_header_value(raw);
        assert!(!escaped.contains(';'));
        assert_eq!(unescape_header_value(&escaped), raw);
    }
}
