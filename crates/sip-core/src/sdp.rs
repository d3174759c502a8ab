//! Minimal audio-only SDP model
//!
//! The softphone negotiates exactly one audio stream, so this model covers
//! one m-line plus the session-level fields around it. Direction attributes
//! matter (hold re-INVITEs flip them); everything else a peer sends is
//! tolerated and dropped on re-serialization.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media flow direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audio payload type mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadType {
    pub id: u8,
    /// `encoding/clock` as it appears in rtpmap, e.g. `PCMU/8000`.
    pub rtpmap: String,
}

/// An audio-only session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub origin_username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub origin_address: String,
    pub connection_address: String,
    pub media_port: u16,
    pub payloads: Vec<PayloadType>,
    pub direction: MediaDirection,
    /// Whether a telephone-event (RFC 4733) payload is offered.
    pub telephone_event: bool,
}

impl SessionDescription {
    /// A default audio offer: PCMU/PCMA plus telephone-event.
    pub fn audio_offer(origin_address: impl Into<String>, media_port: u16) -> Self {
        let origin_address = origin_address.into();
        SessionDescription {
            origin_username: "-".to_string(),
            session_id: 1,
            session_version: 1,
            origin_address: origin_address.clone(),
            connection_address: origin_address,
            media_port,
            payloads: vec![
                PayloadType {
                    id: 0,
                    rtpmap: "PCMU/8000".to_string(),
                },
                PayloadType {
                    id: 8,
                    rtpmap: "PCMA/8000".to_string(),
                },
            ],
            direction: MediaDirection::SendRecv,
            telephone_event: true,
        }
    }

    pub fn with_direction(mut self, direction: MediaDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Bump the version for a re-offer (hold/unhold re-INVITEs).
    pub fn reoffer(mut self, direction: MediaDirection) -> Self {
        self.session_version += 1;
        self.direction = direction;
        self
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} IN IP4 {}\r\n",
            self.origin_username, self.session_id, self.session_version, self.origin_address
        )?;
        write!(f, "s=-\r\n")?;
        write!(f, "c=IN IP4 {}\r\n", self.connection_address)?;
        write!(f, "t=0 0\r\n")?;
        let mut ids: Vec<String> = self.payloads.iter().map(|p| p.id.to_string()).collect();
        if self.telephone_event {
            ids.push("101".to_string());
        }
        write!(f, "m=audio {} RTP/AVP {}\r\n", self.media_port, ids.join(" "))?;
        for p in &self.payloads {
            write!(f, "a=rtpmap:{} {}\r\n", p.id, p.rtpmap)?;
        }
        if self.telephone_event {
            write!(f, "a=rtpmap:101 telephone-event/8000\r\n")?;
            write!(f, "a=fmtp:101 0-16\r\n")?;
        }
        write!(f, "a={}\r\n", self.direction)
    }
}

impl FromStr for SessionDescription {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut origin_username = "-".to_string();
        let mut session_id = 0u64;
        let mut session_version = 0u64;
        let mut origin_address = String::new();
        let mut connection_address = String::new();
        let mut media_port = None;
        let mut payload_ids: Vec<u8> = Vec::new();
        let mut rtpmaps: Vec<(u8, String)> = Vec::new();
        let mut direction = MediaDirection::SendRecv;
        let mut telephone_event = false;
        let mut saw_audio = false;

        for line in input.lines().map(|l| l.trim_end_matches('\r')) {
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin_username = parts[0].to_string();
                        session_id = parts[1].parse().unwrap_or(0);
                        session_version = parts[2].parse().unwrap_or(0);
                        origin_address = parts[5].to_string();
                    }
                }
                "c" => {
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        connection_address = addr.to_string();
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.first() == Some(&"audio") && parts.len() >= 3 {
                        saw_audio = true;
                        media_port = parts.get(1).and_then(|p| p.parse::<u16>().ok());
                        payload_ids = parts[3..]
                            .iter()
                            .filter_map(|p| p.parse::<u8>().ok())
                            .collect();
                    }
                }
                "a" => {
                    if !saw_audio {
                        continue;
                    }
                    match value.split(':').next().unwrap_or(value) {
                        "sendrecv" => direction = MediaDirection::SendRecv,
                        "sendonly" => direction = MediaDirection::SendOnly,
                        "recvonly" => direction = MediaDirection::RecvOnly,
                        "inactive" => direction = MediaDirection::Inactive,
                        "rtpmap" => {
                            if let Some(rest) = value.strip_prefix("rtpmap:") {
                                let mut parts = rest.split_whitespace();
                                if let (Some(id), Some(map)) = (parts.next(), parts.next()) {
                                    if let Ok(id) = id.parse::<u8>() {
                                        if map.to_ascii_lowercase().starts_with("telephone-event") {
                                            telephone_event = true;
                                        } else {
                                            rtpmaps.push((id, map.to_string()));
                                        }
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let media_port = media_port.ok_or_else(|| Error::InvalidSdp {
            reason: "no audio m-line".to_string(),
        })?;

        let payloads = payload_ids
            .iter()
            .filter(|id| **id != 101)
            .map(|id| PayloadType {
                id: *id,
                rtpmap: rtpmaps
                    .iter()
                    .find(|(mid, _)| mid == id)
                    .map(|(_, m)| m.clone())
                    .unwrap_or_else(|| default_rtpmap(*id)),
            })
            .collect();

        if connection_address.is_empty() {
            connection_address = origin_address.clone();
        }

        Ok(SessionDescription {
            origin_username,
            session_id,
            session_version,
            origin_address,
            connection_address,
            media_port,
            payloads,
            direction,
            telephone_event,
        })
    }
}

fn default_rtpmap(id: u8) -> String {
    match id {
        0 => "PCMU/8000".to_string(),
        8 => "PCMA/8000".to_string(),
        9 => "G722/8000".to_string(),
        18 => "G729/8000".to_string(),
        other => format!("unknown/{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_round_trip() {
        let offer = SessionDescription::audio_offer("192.0.2.10", 49170);
        let text = offer.to_string();
        assert!(text.contains("m=audio 49170 RTP/AVP 0 8 101"));
        assert!(text.contains("a=sendrecv"));
        let parsed: SessionDescription = text.parse().unwrap();
        assert_eq!(parsed.media_port, 49170);
        assert_eq!(parsed.direction, MediaDirection::SendRecv);
        assert!(parsed.telephone_event);
        assert_eq!(parsed.payloads.len(), 2);
    }

    #[test]
    fn hold_reoffer_flips_direction_and_bumps_version() {
        let offer = SessionDescription::audio_offer("192.0.2.10", 49170);
        let held = offer.clone().reoffer(MediaDirection::Inactive);
        assert_eq!(held.session_version, offer.session_version + 1);
        assert!(held.to_string().contains("a=inactive"));
    }

    #[test]
    fn parses_foreign_answer() {
        let text = "v=0\r\no=root 100 101 IN IP4 198.51.100.5\r\ns=call\r\n\
                    c=IN IP4 198.51.100.5\r\nt=0 0\r\n\
                    m=audio 18534 RTP/AVP 8 0 101\r\n\
                    a=rtpmap:8 PCMA/8000\r\na=rtpmap:0 PCMU/8000\r\n\
                    a=rtpmap:101 telephone-event/8000\r\na=sendonly\r\n";
        let parsed: SessionDescription = text.parse().unwrap();
        assert_eq!(parsed.direction, MediaDirection::SendOnly);
        assert_eq!(parsed.connection_address, "198.51.100.5");
        assert_eq!(parsed.payloads[0].rtpmap, "PCMA/8000");
    }

    #[test]
    fn rejects_sdp_without_audio() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";
        assert!(text.parse::<SessionDescription>().is_err());
    }
}
