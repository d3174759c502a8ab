//! `application/dialog-info+xml` parsing (RFC 4235)
//!
//! Busy-lamp-field NOTIFYs carry this format. Only the first `<dialog>`
//! element is interpreted; servers that report several dialogs put the most
//! significant one first.

use crate::error::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// State of the reported dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogState {
    Trying,
    Proceeding,
    Early,
    Confirmed,
    Terminated,
    Unknown(String),
}

impl DialogState {
    fn from_text(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "trying" => DialogState::Trying,
            "proceeding" => DialogState::Proceeding,
            "early" => DialogState::Early,
            "confirmed" => DialogState::Confirmed,
            "terminated" => DialogState::Terminated,
            other => DialogState::Unknown(other.to_string()),
        }
    }
}

/// Direction attribute of the reported dialog, from the watched party's
/// point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogDirection {
    Initiator,
    Recipient,
}

/// The parts of a dialog-info document a presence consumer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogInfo {
    /// The `entity` attribute of the root element, when present.
    pub entity: Option<String>,
    /// State of the first dialog; `None` when the document reports no
    /// dialog at all (an empty notify means the watched party is idle).
    pub state: Option<DialogState>,
    pub direction: Option<DialogDirection>,
    /// `<remote><target uri="..."/>` of the first dialog.
    pub remote_target: Option<String>,
    /// `<remote><identity>` display/uri of the first dialog.
    pub remote_identity: Option<String>,
}

/// Parse a dialog-info+xml document.
pub fn parse_dialog_info(xml: &str) -> Result<DialogInfo> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);

    let mut info = DialogInfo {
        entity: None,
        state: None,
        direction: None,
        remote_target: None,
        remote_identity: None,
    };

    let mut buf = Vec::new();
    let mut dialog_depth = 0usize;
    let mut seen_dialog = false;
    let mut in_first_dialog = false;
    let mut in_state = false;
    let mut in_remote = false;
    let mut in_remote_identity = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"dialog-info" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"entity" {
                            info.entity = Some(String::from_utf8_lossy(&attr.value).into_owned());
                        }
                    }
                }
                b"dialog" => {
                    dialog_depth += 1;
                    if !seen_dialog {
                        seen_dialog = true;
                        in_first_dialog = true;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"direction" {
                                info.direction = match attr.value.as_ref() {
                                    b"initiator" => Some(DialogDirection::Initiator),
                                    b"recipient" => Some(DialogDirection::Recipient),
                                    _ => None,
                                };
                            }
                        }
                    }
                }
                b"state" if in_first_dialog => in_state = true,
                b"remote" if in_first_dialog => in_remote = true,
                b"identity" if in_remote => in_remote_identity = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if in_remote && e.name().as_ref() == b"target" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"uri" {
                            info.remote_target =
                                Some(String::from_utf8_lossy(&attr.value).into_owned());
                        }
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if in_state && info.state.is_none() {
                    let text = e.unescape().map_err(|err| Error::InvalidBody {
                        content_type: "application/dialog-info+xml".to_string(),
                        reason: err.to_string(),
                    })?;
                    info.state = Some(DialogState::from_text(&text));
                } else if in_remote_identity && info.remote_identity.is_none() {
                    let text = e.unescape().map_err(|err| Error::InvalidBody {
                        content_type: "application/dialog-info+xml".to_string(),
                        reason: err.to_string(),
                    })?;
                    info.remote_identity = Some(text.into_owned());
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"dialog" => {
                    dialog_depth = dialog_depth.saturating_sub(1);
                    if dialog_depth == 0 {
                        in_first_dialog = false;
                    }
                }
                b"state" => in_state = false,
                b"remote" => in_remote = false,
                b"identity" => in_remote_identity = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(Error::InvalidBody {
                    content_type: "application/dialog-info+xml".to_string(),
                    reason: err.to_string(),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIRMED: &str = r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="sip:2002@pbx.example.com">
  <dialog id="d1" direction="initiator">
    <state>confirmed</state>
    <remote>
      <identity display="Bob">sip:3000@pbx.example.com</identity>
      <target uri="sip:3000@pbx.example.com"/>
    </remote>
  </dialog>
</dialog-info>"#;

    #[test]
    fn parses_confirmed_dialog() {
        let info = parse_dialog_info(CONFIRMED).unwrap();
        assert_eq!(info.entity.as_deref(), Some("sip:2002@pbx.example.com"));
        assert_eq!(info.state, Some(DialogState::Confirmed));
        assert_eq!(info.direction, Some(DialogDirection::Initiator));
        assert_eq!(info.remote_target.as_deref(), Some("sip:3000@pbx.example.com"));
        assert_eq!(info.remote_identity.as_deref(), Some("sip:3000@pbx.example.com"));
    }

    #[test]
    fn only_first_dialog_is_read() {
        let xml = r#"<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="2" state="full" entity="sip:x@y">
  <dialog id="a" direction="recipient"><state>early</state></dialog>
  <dialog id="b"><state>terminated</state></dialog>
</dialog-info>"#;
        let info = parse_dialog_info(xml).unwrap();
        assert_eq!(info.state, Some(DialogState::Early));
        assert_eq!(info.direction, Some(DialogDirection::Recipient));
    }

    #[test]
    fn empty_document_has_no_state() {
        let xml = r#"<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="0" state="full" entity="sip:x@y"/>"#;
        let info = parse_dialog_info(xml).unwrap();
        assert!(info.state.is_none());
        assert_eq!(info.entity.as_deref(), Some("sip:x@y"));
    }

    #[test]
    fn unknown_state_is_preserved() {
        let xml = "<dialog-info><dialog><state>weird</state></dialog></dialog-info>";
        let info = parse_dialog_info(xml).unwrap();
        assert_eq!(info.state, Some(DialogState::Unknown("weird".to_string())));
    }

    #[test]
    fn malformed_xml_errors() {
        assert!(parse_dialog_info("<dialog-info><<state>").is_err());
    }
}
