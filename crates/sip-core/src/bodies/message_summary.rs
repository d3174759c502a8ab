//! `application/simple-message-summary` parsing (RFC 3842)
//!
//! Voicemail waiting indications arrive as NOTIFYs with `Event:
//! message-summary`. The format is line-oriented; servers vary in how much
//! of it they send, so parsing is lenient: anything unrecognised is
//! skipped.

use serde::{Deserialize, Serialize};

/// A parsed message-summary body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// `Messages-Waiting: yes|no`
    pub messages_waiting: bool,
    /// New voice messages (`Voice-Message: new/old`).
    pub voice_new: u32,
    /// Old voice messages.
    pub voice_old: u32,
    /// New urgent voice messages, when the server reports them
    /// (`Voice-Message: new/old (urgent-new/urgent-old)`).
    pub voice_urgent_new: u32,
    pub voice_urgent_old: u32,
    /// `Message-Account:` value, when present.
    pub account: Option<String>,
}

/// Parse a message-summary body. Never fails; an empty or unrecognised
/// body yields the default (no messages waiting).
pub fn parse_message_summary(body: &str) -> MessageSummary {
    let mut summary = MessageSummary::default();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "messages-waiting" => {
                summary.messages_waiting = value.eq_ignore_ascii_case("yes");
            }
            "message-account" => {
                summary.account = Some(value.to_string());
            }
            "voice-message" => {
                let (counts, urgent) = match value.split_once('(') {
                    Some((c, u)) => (c.trim(), Some(u.trim_end_matches(')').trim())),
                    None => (value, None),
                };
                let (new, old) = parse_count_pair(counts);
                summary.voice_new = new;
                summary.voice_old = old;
                if let Some(urgent) = urgent {
                    let (unew, uold) = parse_count_pair(urgent);
                    summary.voice_urgent_new = unew;
                    summary.voice_urgent_old = uold;
                }
            }
            _ => {}
        }
    }
    summary
}

fn parse_count_pair(value: &str) -> (u32, u32) {
    let mut parts = value.split('/');
    let new = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    let old = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    (new, old)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_body() {
        let body = "Messages-Waiting: yes\r\nMessage-Account: sip:*97@pbx.example.com\r\nVoice-Message: 2/8 (0/2)\r\n";
        let summary = parse_message_summary(body);
        assert!(summary.messages_waiting);
        assert_eq!(summary.voice_new, 2);
        assert_eq!(summary.voice_old, 8);
        assert_eq!(summary.voice_urgent_old, 2);
        assert_eq!(summary.account.as_deref(), Some("sip:*97@pbx.example.com"));
    }

    #[test]
    fn no_messages() {
        let summary = parse_message_summary("Messages-Waiting: no\r\n");
        assert!(!summary.messages_waiting);
        assert_eq!(summary.voice_new, 0);
    }

    #[test]
    fn empty_body_is_default() {
        assert_eq!(parse_message_summary(""), MessageSummary::default());
    }

    #[test]
    fn counts_without_urgent_section() {
        let summary = parse_message_summary("Messages-Waiting: yes\r\nVoice-Message: 3/0\r\n");
        assert_eq!(summary.voice_new, 3);
        assert_eq!(summary.voice_urgent_new, 0);
    }
}
