//! Wire-format parsing for SIP messages
//!
//! WebSocket framing (RFC 7118) delivers exactly one SIP message per frame,
//! so the parser takes a complete text message. Start lines go through nom;
//! header lines are split on the first colon with folding continuation
//! lines joined onto their parent.

use crate::error::{Error, Result};
use crate::message::{Message, Request, Response, SIP_VERSION};
use crate::types::header::{HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::SipUri;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::char,
    IResult,
};
use std::str::FromStr;

/// Parse one complete SIP message.
///
/// # Examples
///
/// ```rust
/// use softline_sip_core::{parse_message, Message};
///
/// let wire = "SIP/2.0 200 OK\r\nVia: SIP/2.0/WSS client.invalid;branch=z9hG4bK1\r\n\
///             Call-ID: abc@pbx\r\nCSeq: 1 REGISTER\r\nContent-Length: 0\r\n\r\n";
/// let msg = parse_message(wire).unwrap();
/// assert!(matches!(msg, Message::Response(_)));
/// ```
pub fn parse_message(input: &str) -> Result<Message> {
    let (head, body) = split_head_body(input);
    let mut lines = unfold_lines(head);
    let start_line = loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => return Err(Error::message("empty message")),
        }
    };

    let headers = parse_headers(lines)?;
    let body = resolve_body(&headers, body);

    if start_line.starts_with(SIP_VERSION) {
        let (status, reason) = parse_status_line(&start_line)?;
        Ok(Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }))
    } else {
        let (method, uri) = parse_request_line(&start_line)?;
        Ok(Message::Request(Request {
            method,
            uri,
            headers,
            body,
        }))
    }
}

fn split_head_body(input: &str) -> (&str, &str) {
    match input.find("\r\n\r\n") {
        Some(idx) => (&input[..idx], &input[idx + 4..]),
        None => match input.find("\n\n") {
            Some(idx) => (&input[..idx], &input[idx + 2..]),
            None => (input, ""),
        },
    }
}

/// Join folded continuation lines (starting with SP/HT) onto their parent.
fn unfold_lines(head: &str) -> impl Iterator<Item = String> + '_ {
    let mut result: Vec<String> = Vec::new();
    for raw in head.split("\r\n").flat_map(|l| l.split('\n')) {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.push(' ');
                last.push_str(raw.trim());
                continue;
            }
        }
        result.push(raw.to_string());
    }
    result.into_iter()
}

fn parse_headers(lines: impl Iterator<Item = String>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            Error::message(format!("header line without colon: {:?}", line))
        })?;
        let name = HeaderName::from_str(name).unwrap_or(HeaderName::Other(name.to_string()));
        headers.push(name, value.trim());
    }
    Ok(headers)
}

fn resolve_body(headers: &Headers, body: &str) -> Vec<u8> {
    match headers.content_length() {
        Some(len) if len <= body.len() => body.as_bytes()[..len].to_vec(),
        _ => body.as_bytes().to_vec(),
    }
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (rest, method) = token(input)?;
    let (rest, _) = char(' ')(rest)?;
    let (rest, uri) = token(rest)?;
    let (rest, _) = char(' ')(rest)?;
    let (rest, _) = tag(SIP_VERSION)(rest)?;
    Ok((rest, (method, uri)))
}

fn parse_request_line(line: &str) -> Result<(Method, SipUri)> {
    let (_, (method, uri)) = request_line(line.trim())
        .map_err(|_| Error::message(format!("bad request line: {:?}", line)))?;
    let method = Method::from_str(method).unwrap_or(Method::Extension(method.to_string()));
    let uri: SipUri = uri.parse()?;
    Ok((method, uri))
}

fn parse_status_line(line: &str) -> Result<(StatusCode, Option<String>)> {
    let rest = line
        .trim()
        .strip_prefix(SIP_VERSION)
        .ok_or_else(|| Error::message("missing SIP version"))?
        .trim_start();
    let (code_str, reason) = match rest.split_once(' ') {
        Some((c, r)) => (c, Some(r.trim().to_string())),
        None => (rest, None),
    };
    let code: u16 = code_str
        .parse()
        .map_err(|_| Error::message(format!("bad status code: {:?}", code_str)))?;
    if !(100..700).contains(&code) {
        return Err(Error::message(format!("status code out of range: {}", code)));
    }
    Ok((StatusCode(code), reason.filter(|r| !r.is_empty())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::header::HeaderName;

    const INVITE: &str = "INVITE sip:2000@pbx.example.com SIP/2.0\r\n\
        Via: SIP/2.0/WSS df7jal23ls0d.invalid;branch=z9hG4bKab1\r\n\
        Max-Forwards: 70\r\n\
        From: \"Agent\" <sip:1001@pbx.example.com>;tag=ft1\r\n\
        To: <sip:2000@pbx.example.com>\r\n\
        Call-ID: cid1@df7jal23ls0d.invalid\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\r\n";

    #[test]
    fn parses_request() {
        let msg = parse_message(INVITE).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri.user.as_deref(), Some("2000"));
        assert_eq!(req.call_id(), Some("cid1@df7jal23ls0d.invalid"));
        assert_eq!(req.cseq().unwrap().seq, 1);
        assert_eq!(req.body, b"v=0");
    }

    #[test]
    fn parses_response_with_reason() {
        let wire = "SIP/2.0 486 Busy Here\r\nCall-ID: x@y\r\nCSeq: 2 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_message(wire).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status, StatusCode::BUSY_HERE);
        assert_eq!(resp.reason_phrase(), "Busy Here");
    }

    #[test]
    fn folded_header_is_unfolded() {
        let wire = "SIP/2.0 200 OK\r\nSubject: first\r\n second\r\nCall-ID: x@y\r\nCSeq: 1 OPTIONS\r\n\r\n";
        let msg = parse_message(wire).unwrap();
        let subject = msg
            .headers()
            .get(&HeaderName::Other("Subject".to_string()))
            .unwrap();
        assert_eq!(subject, "first second");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_message("").is_err());
        assert!(parse_message("hello world\r\n\r\n").is_err());
        assert!(parse_message("SIP/2.0 999999 Nope\r\n\r\n").is_err());
    }

    #[test]
    fn round_trip_preserves_unknown_headers() {
        let msg = parse_message(INVITE).unwrap();
        let rendered = msg.to_string();
        let reparsed = parse_message(&rendered).unwrap();
        assert_eq!(reparsed.call_id(), msg.call_id());
    }
}
