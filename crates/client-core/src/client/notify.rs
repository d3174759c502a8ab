//! NOTIFY dispatch
//!
//! Every NOTIFY is answered 200 before interpretation; a watcher that
//! cannot parse a body must not make the server retry it.

use super::SoftphoneClient;
use crate::events::{ClientEvent, NotifyBody};
use softline_sip_core::bodies::message_summary::parse_message_summary;
use softline_sip_core::{Request, StatusCode};
use tracing::debug;

impl SoftphoneClient {
    pub(crate) async fn handle_incoming_notify(&self, request: Request) {
        self.reply(&request, StatusCode::OK).await;

        let event = request
            .headers
            .event_package()
            .unwrap_or("")
            .to_ascii_lowercase();
        let content_type = request.headers.content_type().unwrap_or_default();

        if event == "dialog" || content_type == "application/dialog-info+xml" {
            self.handle_blf_notify(&request).await;
            return;
        }

        if event == "message-summary" || content_type == "application/simple-message-summary" {
            let summary = parse_message_summary(request.body_str());
            debug!(
                waiting = summary.messages_waiting,
                new = summary.voice_new,
                "voicemail indication"
            );
            self.inner.bus.emit(ClientEvent::NotifyReceived {
                event: "message-summary".to_string(),
                body: NotifyBody::Voicemail { summary },
            });
            return;
        }

        if event == "refer" || content_type == "message/sipfrag" {
            if let Some(session) = request
                .call_id()
                .and_then(|call_id| self.session_by_call_id(call_id))
            {
                self.handle_refer_notify(session, request.body_str()).await;
            }
            return;
        }

        // Unknown package: accepted above, forwarded raw.
        self.inner.bus.emit(ClientEvent::NotifyReceived {
            event: if event.is_empty() {
                "unknown".to_string()
            } else {
                event
            },
            body: NotifyBody::Raw {
                content_type: request.headers.content_type(),
                body: request.body_str().to_string(),
            },
        });
    }
}
