//! SIP requests, responses, and the combined message type

use crate::error::{Error, Result};
use crate::types::header::{CSeq, HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::SipUri;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SIP_VERSION: &str = "SIP/2.0";

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers.cseq()
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, SIP_VERSION)?;
        write_headers_and_body(f, &self.headers, &self.body)
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase as received; `None` renders the canonical phrase.
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: None,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason())
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers.cseq()
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            SIP_VERSION,
            self.status.code(),
            self.reason_phrase()
        )?;
        write_headers_and_body(f, &self.headers, &self.body)
    }
}

fn write_headers_and_body(
    f: &mut fmt::Formatter<'_>,
    headers: &Headers,
    body: &[u8],
) -> fmt::Result {
    for header in headers.iter() {
        if header.name == HeaderName::ContentLength {
            continue;
        }
        write!(f, "{}\r\n", header)?;
    }
    write!(f, "Content-Length: {}\r\n\r\n", body.len())?;
    if !body.is_empty() {
        f.write_str(&String::from_utf8_lossy(body))?;
    }
    Ok(())
}

/// Either side of the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().call_id()
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers().cseq()
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r),
        }
    }

    pub fn into_request(self) -> Result<Request> {
        match self {
            Message::Request(r) => Ok(r),
            Message::Response(_) => Err(Error::message("expected a request")),
        }
    }

    pub fn into_response(self) -> Result<Response> {
        match self {
            Message::Request(_) => Err(Error::message("expected a response")),
            Message::Response(r) => Ok(r),
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}
