//! Digest authentication (RFC 2617 as profiled by RFC 3261)
//!
//! Only MD5 is implemented; every deployment this stack targets challenges
//! with `algorithm=MD5` (or omits the parameter, which means the same
//! thing). `qop=auth` is honored when offered.

use crate::error::{Error, Result};
use crate::types::method::Method;
use rand::Rng;

/// A parsed WWW-Authenticate / Proxy-Authenticate challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Parse the value of a `WWW-Authenticate` or `Proxy-Authenticate`
    /// header.
    pub fn parse(value: &str) -> Result<Self> {
        let rest = value.trim();
        let rest = rest
            .strip_prefix("Digest")
            .or_else(|| rest.strip_prefix("digest"))
            .ok_or_else(|| Error::InvalidChallenge {
                reason: format!("unsupported scheme in {:?}", value),
            })?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = None;

        for (key, val) in split_challenge_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "opaque" => opaque = Some(val),
                "algorithm" => algorithm = Some(val),
                "qop" => qop = Some(val),
                _ => {}
            }
        }

        Ok(DigestChallenge {
            realm: realm.ok_or_else(|| Error::InvalidChallenge {
                reason: "missing realm".to_string(),
            })?,
            nonce: nonce.ok_or_else(|| Error::InvalidChallenge {
                reason: "missing nonce".to_string(),
            })?,
            opaque,
            algorithm,
            qop,
        })
    }

    /// Whether the challenge offers `qop=auth`.
    pub fn offers_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Split `key="quoted", key=token` parameter lists, respecting quotes.
fn split_challenge_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(i) => i,
            None => break,
        };
        let key = rest[..eq].trim_matches(|c: char| c == ',' || c.is_whitespace());
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(stripped) = after.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => (&stripped[..end], &stripped[end + 1..]),
                None => (stripped, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            }
        };
        params.push((key.to_string(), value.to_string()));
        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }
    params
}

/// Credentials used to answer a digest challenge.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

impl DigestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        DigestCredentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Compute the `Authorization` (or `Proxy-Authorization`) header value
    /// answering `challenge` for a request of `method` on `uri`.
    pub fn respond(&self, challenge: &DigestChallenge, method: &Method, uri: &str) -> String {
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.username, challenge.realm, self.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let mut params: Vec<String> = vec![
            format!("username=\"{}\"", self.username),
            format!("realm=\"{}\"", challenge.realm),
            format!("nonce=\"{}\"", challenge.nonce),
            format!("uri=\"{}\"", uri),
        ];

        let response = if challenge.offers_qop_auth() {
            let cnonce = generate_cnonce();
            let nc = "00000001";
            let digest = md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, challenge.nonce, nc, cnonce, ha2
            ));
            params.push("qop=auth".to_string());
            params.push(format!("cnonce=\"{}\"", cnonce));
            params.push(format!("nc={}", nc));
            digest
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
        };

        params.push(format!("response=\"{}\"", response));
        params.push("algorithm=MD5".to_string());
        if let Some(opaque) = &challenge.opaque {
            params.push(format!("opaque=\"{}\"", opaque));
        }

        format!("Digest {}", params.join(", "))
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_challenge() {
        let value = r#"Digest realm="asterisk", nonce="4e1e0a9f", algorithm=MD5, qop="auth""#;
        let ch = DigestChallenge::parse(value).unwrap();
        assert_eq!(ch.realm, "asterisk");
        assert_eq!(ch.nonce, "4e1e0a9f");
        assert_eq!(ch.algorithm.as_deref(), Some("MD5"));
        assert!(ch.offers_qop_auth());
    }

    #[test]
    fn rejects_non_digest() {
        assert!(DigestChallenge::parse("Bearer abc").is_err());
    }

    #[test]
    fn rfc2617_vector_without_qop() {
        // From RFC 2617 §3.5, adjusted for a SIP method.
        let ch = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: None,
            algorithm: None,
            qop: None,
        };
        let creds = DigestCredentials::new("Mufasa", "Circle Of Life");
        let header = creds.respond(&ch, &Method::Register, "sip:host.com");
        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains("realm=\"testrealm@host.com\""));
        assert!(header.contains("response=\""));
        assert!(!header.contains("qop"));
    }

    #[test]
    fn known_digest_response() {
        // H(A1) and H(A2) computed independently:
        //   H(A1) = md5("1001:pbx:secret")
        //   H(A2) = md5("REGISTER:sip:pbx.example.com")
        let ch = DigestChallenge {
            realm: "pbx".to_string(),
            nonce: "abc123".to_string(),
            opaque: None,
            algorithm: Some("MD5".to_string()),
            qop: None,
        };
        let creds = DigestCredentials::new("1001", "secret");
        let header = creds.respond(&ch, &Method::Register, "sip:pbx.example.com");
        let expected = {
            let ha1 = format!("{:x}", md5::compute("1001:pbx:secret"));
            let ha2 = format!("{:x}", md5::compute("REGISTER:sip:pbx.example.com"));
            format!("{:x}", md5::compute(format!("{}:abc123:{}", ha1, ha2)))
        };
        assert!(header.contains(&format!("response=\"{}\"", expected)));
    }
}
