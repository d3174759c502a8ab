//! Name-addr handling for From/To/Contact/Refer-To headers

use crate::error::{Error, Result};
use crate::types::uri::SipUri;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A SIP address: optional display name, URI, and header parameters.
///
/// This is the value shape of From, To, Contact and Refer-To headers. The
/// `tag` header parameter identifies the dialog half and gets dedicated
/// accessors.
///
/// # Examples
///
/// ```rust
/// use softline_sip_core::Address;
///
/// let addr: Address = "\"Bob\" <sip:2000@pbx.example.com>;tag=a48s".parse().unwrap();
/// assert_eq!(addr.display_name.as_deref(), Some("Bob"));
/// assert_eq!(addr.tag(), Some("a48s"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: SipUri,
    /// Header parameters following the closing `>`.
    pub params: Vec<(String, Option<String>)>,
}

impl Address {
    pub fn new(uri: SipUri) -> Self {
        Address {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// The `tag` parameter, if present.
    pub fn tag(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("tag"))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Set or replace the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        for (k, v) in self.params.iter_mut() {
            if k.eq_ignore_ascii_case("tag") {
                *v = Some(tag);
                return;
            }
        }
        self.params.push(("tag".to_string(), Some(tag)));
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_tag(tag);
        self
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let close = s.find('>').ok_or_else(|| Error::InvalidHeader {
                name: "address".to_string(),
                value: s.to_string(),
            })?;
            if close < open {
                return Err(Error::InvalidHeader {
                    name: "address".to_string(),
                    value: s.to_string(),
                });
            }
            let display = s[..open].trim().trim_matches('"').trim();
            let uri: SipUri = s[open + 1..close].parse()?;
            let params = parse_params(&s[close + 1..]);
            Ok(Address {
                display_name: if display.is_empty() {
                    None
                } else {
                    Some(display.to_string())
                },
                uri,
                params,
            })
        } else {
            // Bare URI form: any tag parameter parsed into the URI actually
            // belongs to the header.
            let mut uri: SipUri = s.parse()?;
            let mut params = Vec::new();
            uri.params.retain(|(k, v)| {
                if k.eq_ignore_ascii_case("tag") {
                    params.push((k.clone(), v.clone()));
                    false
                } else {
                    true
                }
            });
            Ok(Address {
                display_name: None,
                uri,
                params,
            })
        }
    }
}

fn parse_params(s: &str) -> Vec<(String, Option<String>)> {
    s.split(';')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}
