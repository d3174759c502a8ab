//! Fluent builders for requests and responses
//!
//! The builders hold the boilerplate a user agent repeats on every message:
//! Via with a fresh branch, From/To/Call-ID/CSeq dialog identification, and
//! Content-Length bookkeeping (computed at render time by the message
//! itself).

use crate::message::{Request, Response};
use crate::types::address::Address;
use crate::types::header::{CSeq, HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::SipUri;
use rand::Rng;

/// The magic cookie every RFC 3261 branch parameter starts with.
pub const BRANCH_COOKIE: &str = "z9hG4bK";

/// Generate a fresh Via branch parameter.
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    format!("{}{:016x}", BRANCH_COOKIE, rng.gen::<u64>())
}

/// Generate a From/To tag.
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

/// Generate a Call-ID scoped to `host`.
pub fn generate_call_id(host: &str) -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:08x}@{}", rng.gen::<u64>(), rng.gen::<u32>(), host)
}

/// Builder for outgoing requests.
///
/// # Examples
///
/// ```rust
/// use softline_sip_core::{Address, Method, RequestBuilder, SipUri};
///
/// let to = Address::new(SipUri::new("2000", "pbx.example.com"));
/// let from = Address::new(SipUri::new("1001", "pbx.example.com")).with_tag("abc");
/// let req = RequestBuilder::new(Method::Invite, SipUri::new("2000", "pbx.example.com"))
///     .via("pbx.example.com", "WSS")
///     .from(from)
///     .to(to)
///     .call_id("deadbeef@pbx.example.com")
///     .cseq(1, Method::Invite)
///     .max_forwards(70)
///     .build();
/// assert_eq!(req.call_id(), Some("deadbeef@pbx.example.com"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: SipUri) -> Self {
        RequestBuilder {
            request: Request::new(method, uri),
        }
    }

    /// Add a Via header for `host` over `transport` with a fresh branch.
    pub fn via(mut self, host: &str, transport: &str) -> Self {
        self.request.headers.push(
            HeaderName::Via,
            format!(
                "SIP/2.0/{} {};branch={}",
                transport.to_ascii_uppercase(),
                host,
                generate_branch()
            ),
        );
        self
    }

    /// Add a Via header with a caller-chosen branch (CANCEL must reuse the
    /// branch of the INVITE it cancels).
    pub fn via_with_branch(mut self, host: &str, transport: &str, branch: &str) -> Self {
        self.request.headers.push(
            HeaderName::Via,
            format!(
                "SIP/2.0/{} {};branch={}",
                transport.to_ascii_uppercase(),
                host,
                branch
            ),
        );
        self
    }

    pub fn from(mut self, address: Address) -> Self {
        self.request
            .headers
            .set(HeaderName::From, address.to_string());
        self
    }

    pub fn to(mut self, address: Address) -> Self {
        self.request.headers.set(HeaderName::To, address.to_string());
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.request.headers.set(HeaderName::CallId, call_id.into());
        self
    }

    pub fn cseq(mut self, seq: u32, method: Method) -> Self {
        self.request
            .headers
            .set(HeaderName::CSeq, CSeq::new(seq, method).to_string());
        self
    }

    pub fn contact(mut self, address: Address) -> Self {
        self.request
            .headers
            .set(HeaderName::Contact, address.to_string());
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.request
            .headers
            .set(HeaderName::MaxForwards, hops.to_string());
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.request
            .headers
            .set(HeaderName::Expires, seconds.to_string());
        self
    }

    pub fn event(mut self, package: &str) -> Self {
        self.request.headers.set(HeaderName::Event, package);
        self
    }

    pub fn accept(mut self, media_type: &str) -> Self {
        self.request.headers.push(HeaderName::Accept, media_type);
        self
    }

    pub fn user_agent(mut self, agent: &str) -> Self {
        self.request.headers.set(HeaderName::UserAgent, agent);
        self
    }

    pub fn refer_to(mut self, target: &str) -> Self {
        self.request.headers.set(HeaderName::ReferTo, target);
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.request.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.request
            .headers
            .set(HeaderName::ContentType, content_type);
        self.request.body = body;
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

/// Builder for responses to a received request.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    /// Start a response mirroring the dialog-identifying headers of
    /// `request` (Via set, From, To, Call-ID, CSeq).
    pub fn reply_to(request: &Request, status: StatusCode) -> Self {
        let mut headers = Headers::new();
        for via in request.headers.get_all(&HeaderName::Via) {
            headers.push(HeaderName::Via, via);
        }
        for name in [HeaderName::From, HeaderName::To, HeaderName::CallId, HeaderName::CSeq] {
            if let Some(value) = request.headers.get(&name) {
                headers.push(name.clone(), value);
            }
        }
        ResponseBuilder {
            response: Response {
                status,
                reason: None,
                headers,
                body: Vec::new(),
            },
        }
    }

    /// Ensure the To header carries a tag, adding `tag` when absent.
    pub fn to_tag(mut self, tag: &str) -> Self {
        if let Ok(mut to) = self.response.headers.to_address() {
            if to.tag().is_none() {
                to.set_tag(tag);
                self.response.headers.set(HeaderName::To, to.to_string());
            }
        }
        self
    }

    pub fn contact(mut self, address: Address) -> Self {
        self.response
            .headers
            .set(HeaderName::Contact, address.to_string());
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.response.headers.push(name, value);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.response.reason = Some(reason.into());
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.response
            .headers
            .set(HeaderName::ContentType, content_type);
        self.response.body = body;
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_has_cookie_prefix() {
        let b = generate_branch();
        assert!(b.starts_with(BRANCH_COOKIE));
        assert_ne!(generate_branch(), generate_branch());
    }

    #[test]
    fn reply_mirrors_dialog_headers() {
        let req = RequestBuilder::new(Method::Invite, SipUri::new("2000", "pbx.example.com"))
            .via("client.invalid", "WSS")
            .from(Address::new(SipUri::new("1001", "pbx.example.com")).with_tag("ft"))
            .to(Address::new(SipUri::new("2000", "pbx.example.com")))
            .call_id("cid@pbx.example.com")
            .cseq(2, Method::Invite)
            .build();

        let resp = ResponseBuilder::reply_to(&req, StatusCode::RINGING)
            .to_tag("tt")
            .build();
        assert_eq!(resp.call_id(), Some("cid@pbx.example.com"));
        assert_eq!(resp.cseq().unwrap().seq, 2);
        let to = resp.headers.to_address().unwrap();
        assert_eq!(to.tag(), Some("tt"));
    }

    #[test]
    fn to_tag_does_not_replace_existing() {
        let req = RequestBuilder::new(Method::Bye, SipUri::new("2000", "pbx.example.com"))
            .via("client.invalid", "WSS")
            .from(Address::new(SipUri::new("1001", "pbx.example.com")).with_tag("ft"))
            .to(Address::new(SipUri::new("2000", "pbx.example.com")).with_tag("orig"))
            .call_id("cid2@pbx.example.com")
            .cseq(3, Method::Bye)
            .build();
        let resp = ResponseBuilder::reply_to(&req, StatusCode::OK).to_tag("new").build();
        assert_eq!(resp.headers.to_address().unwrap().tag(), Some("orig"));
    }
}
