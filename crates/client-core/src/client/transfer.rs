//! Blind and attended call transfer (REFER, RFC 3515 / Replaces, RFC 3891)

use super::dialog::{Session, TransferRole};
use super::SoftphoneClient;
use crate::call::{CallState, SessionId};
use crate::error::{ClientError, ClientResult};
use crate::events::{AttendedTransferStatus, ClientEvent};
use softline_sip_core::types::uri::escape_header_value;
use softline_sip_core::{Address, HeaderName, Method, SipUri, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grace period between an accepted REFER and our BYE of the original leg.
const TRANSFER_BYE_DELAY: Duration = Duration::from_secs(2);

impl SoftphoneClient {
    /// Blind-transfer an established call to `target`. Resolves once the
    /// server accepts or refuses the REFER; on accept, the original call
    /// is released shortly after.
    pub async fn blind_transfer(
        &self,
        session_id: &SessionId,
        target: &str,
    ) -> ClientResult<()> {
        let session = self.session_checked(session_id)?;
        if !matches!(session.state(), CallState::Established | CallState::Hold) {
            return Err(ClientError::SessionNotEstablished {
                session_id: session_id.to_string(),
                state: session.state(),
            });
        }

        let config = self.inner.config.read().await.clone();
        let target_uri = super::calls::build_target_uri(target, &config.domain)?;

        *session.transfer.lock() = Some(TransferRole::Blind {
            target: target.to_string(),
            completed: false,
        });
        self.inner.bus.emit(ClientEvent::TransferInitiated {
            session_id: session.id.clone(),
            target: target.to_string(),
        });

        let mut refer = self.build_in_dialog_request(&session, Method::Refer);
        refer
            .headers
            .set(HeaderName::ReferTo, Address::new(target_uri).to_string());
        refer.headers.set(
            HeaderName::ReferredBy,
            session.dialog.lock().local_address().to_string(),
        );

        let response = self.send_request_await(refer, "blind transfer").await?;
        if response.status.is_success() {
            info!(session = %session_id, target, "blind transfer accepted");
            self.finish_blind_transfer(&session, true, None).await;
            Ok(())
        } else {
            let reason = format!(
                "{} {}",
                response.status.code(),
                response.reason_phrase()
            );
            *session.transfer.lock() = None;
            self.inner.bus.emit(ClientEvent::TransferCompleted {
                session_id: session.id.clone(),
                success: false,
                reason: Some(reason.clone()),
            });
            Err(ClientError::TransferRejected { reason })
        }
    }

    /// Start an attended transfer: hold the original call and place a
    /// consultation call to `target`. Returns the consultation session id.
    /// Completion is a separate, explicit step.
    pub async fn attended_transfer(
        &self,
        original_id: &SessionId,
        target: &str,
    ) -> ClientResult<SessionId> {
        let original = self.session_checked(original_id)?;
        if !matches!(original.state(), CallState::Established | CallState::Hold) {
            return Err(ClientError::SessionNotEstablished {
                session_id: original_id.to_string(),
                state: original.state(),
            });
        }

        if original.state() == CallState::Established {
            self.hold_call(original_id).await?;
        }

        let consultation_id = self
            .make_call(target, super::calls::CallOptions::default())
            .await?;

        if let Ok(consultation) = self.session_checked(&consultation_id) {
            *consultation.transfer.lock() = Some(TransferRole::Consultation {
                original: original_id.clone(),
            });
        }
        *original.transfer.lock() = Some(TransferRole::Original {
            consultation: consultation_id.clone(),
        });

        self.inner.bus.emit(ClientEvent::AttendedTransferInitiated {
            session_id: original_id.clone(),
            transfer_session_id: consultation_id.clone(),
            target: target.to_string(),
            status: AttendedTransferStatus::Trying,
        });
        info!(original = %original_id, consultation = %consultation_id, target, "attended transfer started");
        Ok(consultation_id)
    }

    /// Complete an attended transfer: REFER the original call to the
    /// consultation target with a `Replaces` built from the consultation
    /// dialog's Call-ID and tags.
    pub async fn complete_attended_transfer(
        &self,
        original_id: &SessionId,
        consultation_id: Option<SessionId>,
    ) -> ClientResult<()> {
        let original = self.session_checked(original_id)?;
        let consultation_id = match consultation_id {
            Some(id) => id,
            None => match &*original.transfer.lock() {
                Some(TransferRole::Original { consultation }) => consultation.clone(),
                _ => {
                    return Err(ClientError::SessionNotFound {
                        session_id: "no consultation session".to_string(),
                    })
                }
            },
        };
        let consultation = self.session_checked(&consultation_id)?;
        if consultation.state() != CallState::Established {
            return Err(ClientError::SessionNotEstablished {
                session_id: consultation_id.to_string(),
                state: consultation.state(),
            });
        }

        let config = self.inner.config.read().await.clone();
        let refer_to = {
            let dialog = consultation.dialog.lock();
            let to_tag = dialog.remote_tag.clone().unwrap_or_default();
            let replaces = format!(
                "{};to-tag={};from-tag={}",
                dialog.call_id, to_tag, dialog.local_tag
            );
            let uri = SipUri::new(&consultation.remote_number, &config.domain)
                .with_header("Replaces", escape_header_value(&replaces));
            Address::new(uri).to_string()
        };

        *original.transfer.lock() = Some(TransferRole::CompletePending {
            consultation: consultation_id.clone(),
            completed: false,
        });

        let mut refer = self.build_in_dialog_request(&original, Method::Refer);
        refer.headers.set(HeaderName::ReferTo, refer_to);
        refer.headers.set(
            HeaderName::ReferredBy,
            original.dialog.lock().local_address().to_string(),
        );

        let response = self
            .send_request_await(refer, "attended transfer completion")
            .await?;
        if response.status.is_success() {
            info!(original = %original_id, consultation = %consultation_id, "transfer accepted");
            self.finish_attended_transfer(&original, &consultation_id).await;
            Ok(())
        } else {
            let reason = format!(
                "{} {}",
                response.status.code(),
                response.reason_phrase()
            );
            *original.transfer.lock() = Some(TransferRole::Original {
                consultation: consultation_id,
            });
            self.inner.bus.emit(ClientEvent::TransferCompleted {
                session_id: original.id.clone(),
                success: false,
                reason: Some(reason.clone()),
            });
            Err(ClientError::TransferRejected { reason })
        }
    }

    /// Abort an attended transfer: the consultation call ends, the
    /// original call stays (held).
    pub async fn cancel_attended_transfer(&self, original_id: &SessionId) -> ClientResult<()> {
        let original = self.session_checked(original_id)?;
        let consultation_id = match original.transfer.lock().take() {
            Some(TransferRole::Original { consultation })
            | Some(TransferRole::CompletePending { consultation, .. }) => consultation,
            other => {
                *original.transfer.lock() = other;
                return Err(ClientError::SessionNotFound {
                    session_id: "no consultation session".to_string(),
                });
            }
        };

        if let Ok(consultation) = self.session_checked(&consultation_id) {
            *consultation.transfer.lock() = None;
            let _ = self.hangup_call(Some(consultation_id)).await;
        }

        self.inner.bus.emit(ClientEvent::AttendedTransferCancelled {
            session_id: original_id.clone(),
        });
        info!(original = %original_id, "attended transfer cancelled");
        Ok(())
    }

    // ===== progress plumbing =====

    async fn finish_blind_transfer(
        &self,
        session: &Arc<Session>,
        success: bool,
        reason: Option<String>,
    ) {
        {
            let mut role = session.transfer.lock();
            match &mut *role {
                Some(TransferRole::Blind { completed, .. }) => {
                    if *completed {
                        return;
                    }
                    *completed = true;
                }
                _ => return,
            }
        }
        self.inner.bus.emit(ClientEvent::TransferCompleted {
            session_id: session.id.clone(),
            success,
            reason,
        });
        if success {
            self.schedule_transfer_bye(session);
        }
    }

    async fn finish_attended_transfer(
        &self,
        original: &Arc<Session>,
        consultation_id: &SessionId,
    ) {
        {
            let mut role = original.transfer.lock();
            match &mut *role {
                Some(TransferRole::CompletePending { completed, .. }) => {
                    if *completed {
                        return;
                    }
                    *completed = true;
                }
                _ => return,
            }
        }
        self.inner.bus.emit(ClientEvent::AttendedTransferCompleted {
            session_id: original.id.clone(),
            transfer_session_id: consultation_id.clone(),
        });
        self.inner.bus.emit(ClientEvent::TransferCompleted {
            session_id: original.id.clone(),
            success: true,
            reason: None,
        });
        // Both local legs are released; the server bridges the far ends.
        self.schedule_transfer_bye(original);
        if let Ok(consultation) = self.session_checked(consultation_id) {
            self.schedule_transfer_bye(&consultation);
        }
    }

    fn schedule_transfer_bye(&self, session: &Arc<Session>) {
        let client = self.clone();
        let id = session.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(TRANSFER_BYE_DELAY).await;
            let Ok(session) = client.session_checked(&id) else {
                return;
            };
            let bye = client.build_in_dialog_request(&session, Method::Bye);
            let _ = client.send_message(bye.into()).await;
            client
                .terminate_session(&session, "Transfer completed", CallState::Terminated)
                .await;
        });
        session.timers.lock().deferred_bye = Some(handle);
    }

    /// sipfrag NOTIFY bodies report the outcome of a REFER we sent.
    pub(crate) async fn handle_refer_notify(&self, session: Arc<Session>, body: &str) {
        let Some(code) = parse_sipfrag_status(body) else {
            debug!("unparseable sipfrag body ignored");
            return;
        };
        if code < 200 {
            return;
        }
        let role = session.transfer.lock().clone();
        match role {
            Some(TransferRole::Blind { .. }) => {
                if code < 300 {
                    self.finish_blind_transfer(&session, true, None).await;
                } else {
                    self.finish_blind_transfer(
                        &session,
                        false,
                        Some(format!("refer target answered {}", code)),
                    )
                    .await;
                }
            }
            Some(TransferRole::CompletePending { consultation, .. }) => {
                if code < 300 {
                    self.finish_attended_transfer(&session, &consultation).await;
                } else {
                    self.inner.bus.emit(ClientEvent::TransferCompleted {
                        session_id: session.id.clone(),
                        success: false,
                        reason: Some(format!("refer target answered {}", code)),
                    });
                }
            }
            _ => {}
        }
    }

    /// Late or retransmitted REFER responses that were not matched to a
    /// pending operation.
    pub(crate) async fn handle_refer_response(
        &self,
        session: Arc<Session>,
        response: softline_sip_core::Response,
    ) {
        debug!(
            session = %session.id,
            status = response.status.code(),
            "unmatched REFER response"
        );
        if response.status == StatusCode::ACCEPTED {
            // Already handled through the pending-response path.
            return;
        }
        if response.status.is_error() {
            warn!(status = response.status.code(), "REFER failed out-of-band");
        }
    }

    pub(crate) async fn notify_attended_ringing(&self, session: &Arc<Session>) {
        if let Some(TransferRole::Consultation { original }) = session.transfer.lock().clone() {
            self.inner.bus.emit(ClientEvent::AttendedTransferProgress {
                session_id: original,
                transfer_session_id: session.id.clone(),
                status: AttendedTransferStatus::Ringing,
            });
        }
    }

    pub(crate) async fn notify_attended_answered(&self, session: &Arc<Session>) {
        if let Some(TransferRole::Consultation { original }) = session.transfer.lock().clone() {
            self.inner.bus.emit(ClientEvent::AttendedTransferProgress {
                session_id: original.clone(),
                transfer_session_id: session.id.clone(),
                status: AttendedTransferStatus::Answered,
            });
            self.inner.bus.emit(ClientEvent::AttendedTransferAnswered {
                session_id: original,
                transfer_session_id: session.id.clone(),
            });
        }
    }

    pub(crate) async fn notify_attended_rejected(&self, session: &Arc<Session>, reason: &str) {
        if let Some(TransferRole::Consultation { original }) = session.transfer.lock().clone() {
            self.inner.bus.emit(ClientEvent::AttendedTransferRejected {
                session_id: original,
                transfer_session_id: session.id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Called from session teardown so a dying consultation call reports
    /// itself to the transfer flow.
    pub(crate) fn notify_attended_terminated(&self, session: &Session) {
        if let Some(TransferRole::Consultation { original }) = session.transfer.lock().clone() {
            self.inner.bus.emit(ClientEvent::AttendedTransferTerminated {
                session_id: original.clone(),
                transfer_session_id: session.id.clone(),
            });
            // Unlink the original so a later completion cannot target a
            // dead dialog.
            if let Some(original) = self
                .inner
                .sessions
                .get(&original)
                .map(|e| e.value().clone())
            {
                let mut role = original.transfer.lock();
                if matches!(&*role, Some(TransferRole::Original { consultation }) if *consultation == session.id)
                {
                    *role = None;
                }
            }
        }
    }
}

fn parse_sipfrag_status(body: &str) -> Option<u16> {
    let line = body.lines().next()?.trim();
    let rest = line.strip_prefix("SIP/2.0")?.trim_start();
    let code_str: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    code_str.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sipfrag_parsing() {
        assert_eq!(parse_sipfrag_status("SIP/2.0 200 OK"), Some(200));
        assert_eq!(parse_sipfrag_status("SIP/2.0 180 Ringing\r\n"), Some(180));
        assert_eq!(parse_sipfrag_status("SIP/2.0 603 Decline"), Some(603));
        assert_eq!(parse_sipfrag_status("not a status line"), None);
        assert_eq!(parse_sipfrag_status(""), None);
    }
}
