//! Call operations: dial, answer, hang up, hold, mute
//!
//! Outgoing INVITE responses are driven through the per-session state
//! machine here; incoming INVITEs allocate a line or are refused with 486.

use super::dialog::{Dialog, Session};
use super::registrar::{challenge_from, user_agent_string};
use super::SoftphoneClient;
use crate::call::{CallDirection, CallState, SessionId};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, HoldAction, RegistrationState};
use chrono::Utc;
use softline_sip_core::auth::DigestCredentials;
use softline_sip_core::builder::{generate_branch, generate_call_id, generate_tag};
use softline_sip_core::{
    Address, HeaderName, MediaDirection, Method, Request, RequestBuilder, Response,
    ResponseBuilder, SipUri, StatusCode,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before an incoming call is auto-accepted.
const AUTO_ANSWER_DELAY: Duration = Duration::from_millis(1500);

/// Per-call options for [`SoftphoneClient::make_call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Extra headers appended to the INVITE.
    pub extra_headers: Vec<(String, String)>,
}

impl SoftphoneClient {
    /// Place an outgoing call to `target` (an extension or a full SIP
    /// address). Picks the lowest-numbered idle line.
    pub async fn make_call(
        &self,
        target: &str,
        options: CallOptions,
    ) -> ClientResult<SessionId> {
        if self.registration_state().await != RegistrationState::Registered {
            return Err(ClientError::NotRegistered);
        }

        let config = self.inner.config.read().await.clone();
        let target = target.trim();
        let remote_uri = build_target_uri(target, &config.domain)?;
        let remote_number = remote_uri.user.clone().unwrap_or_else(|| target.to_string());

        let session_id = self.next_session_id();
        let line = self
            .allocate_line(&session_id)
            .ok_or(ClientError::AllLinesBusy)?;

        let media = match self
            .inner
            .media_factory
            .create_session(&config.media)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                self.free_line(line);
                return Err(ClientError::Media {
                    reason: e.to_string(),
                });
            }
        };
        let offer = match media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.free_line(line);
                return Err(ClientError::Media {
                    reason: e.to_string(),
                });
            }
        };

        let mut dialog = Dialog::new(
            generate_call_id(&self.inner.local_host),
            generate_tag(),
            SipUri::new(&config.username, &config.domain),
            remote_uri.clone(),
        );
        dialog.local_display = Some(config.effective_display_name());
        let cseq = dialog.next_cseq();

        let session = Arc::new(Session::new(
            session_id.clone(),
            line,
            CallDirection::Outgoing,
            remote_number,
            dialog,
            CallState::Initiating,
        ));
        *session.media.lock() = Some(media);

        let mut builder = RequestBuilder::new(Method::Invite, remote_uri.clone())
            .via(&self.inner.local_host, "WSS")
            .from(session.dialog.lock().local_address())
            .to(Address::new(remote_uri))
            .call_id(session.call_id())
            .cseq(cseq, Method::Invite)
            .contact(self.contact_address(&config.effective_contact_name()))
            .max_forwards(70)
            .user_agent(user_agent_string());
        for (name, value) in &options.extra_headers {
            builder = builder.header(
                name.parse().unwrap_or(HeaderName::Other(name.clone())),
                value.clone(),
            );
        }
        let invite = builder
            .body("application/sdp", offer.into_bytes())
            .build();

        *session.invite.lock() = Some(invite.clone());
        self.inner
            .call_index
            .insert(session.call_id(), session_id.clone());
        self.inner.sessions.insert(session_id.clone(), session.clone());

        self.inner.stats.total.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.outgoing.fetch_add(1, Ordering::SeqCst);

        self.inner.bus.emit(ClientEvent::SessionCreated {
            session: session.snapshot(),
        });
        self.emit_state(&session, CallState::Initiating);

        if let Err(e) = self.send_message(invite.into()).await {
            self.terminate_session(&session, "Send failed", CallState::Failed)
                .await;
            return Err(e);
        }

        self.start_no_answer_timer(&session, config.no_answer_timeout);
        info!(session = %session_id, line, "outgoing call started");
        Ok(session_id)
    }

    /// Answer an incoming call. Without an id, the session currently in
    /// `ringing` is chosen.
    pub async fn answer_call(&self, session_id: Option<SessionId>) -> ClientResult<()> {
        let session = match session_id {
            Some(id) => self.session_checked(&id)?,
            None => self
                .inner
                .sessions
                .iter()
                .map(|e| e.value().clone())
                .find(|s| {
                    s.direction == CallDirection::Incoming && s.state() == CallState::Ringing
                })
                .ok_or_else(|| ClientError::SessionNotFound {
                    session_id: "no ringing session".to_string(),
                })?,
        };

        if session.direction != CallDirection::Incoming
            || session.state() != CallState::Ringing
        {
            return Err(ClientError::SessionNotEstablished {
                session_id: session.id.to_string(),
                state: session.state(),
            });
        }

        let config = self.inner.config.read().await.clone();
        let invite = session
            .invite
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Internal {
                message: "incoming session without stored INVITE".to_string(),
            })?;

        let media = self
            .inner
            .media_factory
            .create_session(&config.media)
            .await
            .map_err(|e| ClientError::Media {
                reason: e.to_string(),
            })?;
        let answer = media
            .create_answer(invite.body_str())
            .await
            .map_err(|e| ClientError::Media {
                reason: e.to_string(),
            })?;
        *session.media.lock() = Some(media);

        let local_tag = session.dialog.lock().local_tag.clone();
        let response = ResponseBuilder::reply_to(&invite, StatusCode::OK)
            .to_tag(&local_tag)
            .contact(self.contact_address(&config.effective_contact_name()))
            .body("application/sdp", answer.into_bytes())
            .build();
        self.send_message(response.into()).await?;

        session.timers.lock().cancel_all();
        session.locally_answered.store(true, Ordering::SeqCst);
        *session.answered_at.lock() = Some(Utc::now());
        session.set_state(CallState::Established);
        self.emit_state(&session, CallState::Established);
        self.inner.bus.emit(ClientEvent::SessionAnswered {
            session_id: session.id.clone(),
            line: session.line,
        });
        info!(session = %session.id, "call answered");
        Ok(())
    }

    /// Hang up a call: CANCEL an unanswered outgoing leg, reject an
    /// unanswered incoming leg, BYE an established one. Without an id,
    /// the selected line's session (or the first live one) is chosen.
    pub async fn hangup_call(&self, session_id: Option<SessionId>) -> ClientResult<()> {
        let session = match session_id {
            Some(id) => self.session_checked(&id)?,
            None => self
                .selected_session()
                .or_else(|| {
                    self.inner
                        .sessions
                        .iter()
                        .map(|e| e.value().clone())
                        .find(|s| !s.state().is_terminal())
                })
                .ok_or_else(|| ClientError::SessionNotFound {
                    session_id: "no active session".to_string(),
                })?,
        };

        match session.state() {
            state if state.is_early() => match session.direction {
                CallDirection::Outgoing => {
                    if let Err(e) = self.send_cancel(&session).await {
                        warn!(error = %e, "CANCEL failed");
                    }
                    self.terminate_session(&session, "User requested", CallState::Terminated)
                        .await;
                    Ok(())
                }
                CallDirection::Incoming => {
                    if let Some(invite) = session.invite.lock().clone() {
                        let local_tag = session.dialog.lock().local_tag.clone();
                        let response =
                            ResponseBuilder::reply_to(&invite, StatusCode::DECLINE)
                                .to_tag(&local_tag)
                                .build();
                        let _ = self.send_message(response.into()).await;
                    }
                    self.terminate_session(&session, "Call rejected", CallState::Terminated)
                        .await;
                    Ok(())
                }
            },
            CallState::Established | CallState::Hold => {
                let bye = self.build_in_dialog_request(&session, Method::Bye);
                if let Err(e) = self.send_message(bye.into()).await {
                    warn!(error = %e, "BYE failed");
                }
                self.terminate_session(&session, "User requested", CallState::Terminated)
                    .await;
                Ok(())
            }
            _ => Err(ClientError::SessionNotFound {
                session_id: session.id.to_string(),
            }),
        }
    }

    /// Put an established call on hold: local media is gated immediately,
    /// and when the media session supports renegotiation a re-INVITE with
    /// `a=inactive` informs the peer.
    pub async fn hold_call(&self, session_id: &SessionId) -> ClientResult<()> {
        let session = self.session_checked(session_id)?;
        if session.state() != CallState::Established {
            return Err(ClientError::SessionNotEstablished {
                session_id: session_id.to_string(),
                state: session.state(),
            });
        }
        self.set_hold_state(&session, true, MediaDirection::Inactive)
            .await?;
        session.set_state(CallState::Hold);
        self.emit_state(&session, CallState::Hold);
        self.inner.bus.emit(ClientEvent::SessionModified {
            session_id: session.id.clone(),
            action: HoldAction::Hold,
        });
        Ok(())
    }

    /// Resume a held call.
    pub async fn unhold_call(&self, session_id: &SessionId) -> ClientResult<()> {
        let session = self.session_checked(session_id)?;
        if session.state() != CallState::Hold {
            return Err(ClientError::SessionNotEstablished {
                session_id: session_id.to_string(),
                state: session.state(),
            });
        }
        self.set_hold_state(&session, false, MediaDirection::SendRecv)
            .await?;
        session.set_state(CallState::Established);
        self.emit_state(&session, CallState::Established);
        self.inner.bus.emit(ClientEvent::SessionModified {
            session_id: session.id.clone(),
            action: HoldAction::Unhold,
        });
        Ok(())
    }

    pub async fn toggle_hold(&self, session_id: &SessionId) -> ClientResult<()> {
        let session = self.session_checked(session_id)?;
        if session.is_on_hold() {
            self.unhold_call(session_id).await
        } else {
            self.hold_call(session_id).await
        }
    }

    /// Mute the local audio track of an established call.
    pub async fn mute_call(&self, session_id: &SessionId) -> ClientResult<()> {
        self.set_muted(session_id, true).await
    }

    pub async fn unmute_call(&self, session_id: &SessionId) -> ClientResult<()> {
        self.set_muted(session_id, false).await
    }

    pub async fn toggle_mute(&self, session_id: &SessionId) -> ClientResult<()> {
        let session = self.session_checked(session_id)?;
        let muted = session.is_muted();
        self.set_muted(session_id, !muted).await
    }

    async fn set_muted(&self, session_id: &SessionId, muted: bool) -> ClientResult<()> {
        let session = self.session_checked(session_id)?;
        if session.state() != CallState::Established {
            return Err(ClientError::SessionNotEstablished {
                session_id: session_id.to_string(),
                state: session.state(),
            });
        }
        if let Some(media) = session.media_session() {
            media.set_muted(muted).await;
        }
        session.muted.store(muted, Ordering::SeqCst);
        self.inner.bus.emit(ClientEvent::SessionMuted {
            session_id: session.id.clone(),
            muted,
        });
        Ok(())
    }

    async fn set_hold_state(
        &self,
        session: &Arc<Session>,
        hold: bool,
        direction: MediaDirection,
    ) -> ClientResult<()> {
        let media = session.media_session();
        if let Some(media) = &media {
            media.set_hold(hold).await;
            if media.supports_renegotiation() {
                match media.reoffer(direction).await {
                    Ok(sdp) => {
                        let mut reinvite =
                            self.build_in_dialog_request(session, Method::Invite);
                        reinvite
                            .headers
                            .set(HeaderName::ContentType, "application/sdp");
                        reinvite.body = sdp.into_bytes();
                        if let Err(e) = self.send_message(reinvite.into()).await {
                            warn!(error = %e, "hold re-INVITE failed to send");
                        }
                    }
                    Err(e) => warn!(error = %e, "re-offer failed; hold stays local"),
                }
            }
        }
        session.on_hold.store(hold, Ordering::SeqCst);
        Ok(())
    }

    // ===== inbound handling =====

    pub(crate) async fn handle_incoming_invite(&self, request: Request) {
        let call_id = match request.call_id() {
            Some(id) => id.to_string(),
            None => {
                self.reply(&request, StatusCode::BAD_REQUEST).await;
                return;
            }
        };

        // A known dialog means a re-INVITE (hold/unhold from the peer or a
        // session refresh): answer with our current description.
        if let Some(session) = self.session_by_call_id(&call_id) {
            self.handle_reinvite(session, request).await;
            return;
        }

        let from = match request.headers.from_address() {
            Ok(from) => from,
            Err(_) => {
                self.reply(&request, StatusCode::BAD_REQUEST).await;
                return;
            }
        };

        let session_id = self.next_session_id();
        let line = match self.allocate_line(&session_id) {
            Some(line) => line,
            None => {
                debug!("no idle line; refusing call");
                self.reply(&request, StatusCode::BUSY_HERE).await;
                return;
            }
        };

        let config = self.inner.config.read().await.clone();
        let remote_number = from
            .uri
            .user
            .clone()
            .unwrap_or_else(|| from.uri.host.clone());

        let mut dialog = Dialog::new(
            call_id.clone(),
            generate_tag(),
            SipUri::new(&config.username, &config.domain),
            from.uri.clone(),
        );
        dialog.local_display = Some(config.effective_display_name());
        dialog.confirm(
            from.tag().map(|t| t.to_string()),
            request.headers.contact_address().map(|c| c.uri),
        );

        let session = Arc::new(Session::new(
            session_id.clone(),
            line,
            CallDirection::Incoming,
            remote_number.clone(),
            dialog,
            CallState::Ringing,
        ));
        *session.remote_display.lock() = from.display_name.clone();
        *session.invite.lock() = Some(request.clone());

        self.inner.call_index.insert(call_id, session_id.clone());
        self.inner.sessions.insert(session_id.clone(), session.clone());
        self.inner.stats.total.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.incoming.fetch_add(1, Ordering::SeqCst);

        // Caller-id enrichment from the directory, if it knows better.
        if let Some(hit) = self.inner.contacts.lookup_by_number(&remote_number).await {
            *session.remote_display.lock() = Some(hit.display_name);
        }

        let local_tag = session.dialog.lock().local_tag.clone();
        let ringing = ResponseBuilder::reply_to(&request, StatusCode::RINGING)
            .to_tag(&local_tag)
            .contact(self.contact_address(&config.effective_contact_name()))
            .build();
        let _ = self.send_message(ringing.into()).await;

        self.inner.bus.emit(ClientEvent::SessionCreated {
            session: session.snapshot(),
        });
        self.inner.bus.emit(ClientEvent::IncomingCall {
            session: session.snapshot(),
        });
        info!(session = %session_id, line, from = %remote_number, "incoming call");

        let other_active = self
            .inner
            .sessions
            .iter()
            .any(|e| e.key() != &session_id && e.value().state().is_active());
        if config.auto_answer && !other_active {
            let client = self.clone();
            let id = session_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(AUTO_ANSWER_DELAY).await;
                let still_ringing = client
                    .session_checked(&id)
                    .map(|s| s.state() == CallState::Ringing)
                    .unwrap_or(false);
                if still_ringing {
                    if let Err(e) = client.answer_call(Some(id)).await {
                        warn!(error = %e, "auto-answer failed");
                    }
                }
            });
            session.timers.lock().auto_answer = Some(handle);
        }
    }

    async fn handle_reinvite(&self, session: Arc<Session>, request: Request) {
        let answer = match session.media_session() {
            Some(media) => media.create_answer(request.body_str()).await.ok(),
            None => None,
        };
        let local_tag = session.dialog.lock().local_tag.clone();
        let config = self.inner.config.read().await.clone();
        let mut builder = ResponseBuilder::reply_to(&request, StatusCode::OK)
            .to_tag(&local_tag)
            .contact(self.contact_address(&config.effective_contact_name()));
        if let Some(answer) = answer {
            builder = builder.body("application/sdp", answer.into_bytes());
        }
        let _ = self.send_message(builder.build().into()).await;
    }

    pub(crate) async fn handle_incoming_bye(&self, request: Request) {
        self.reply(&request, StatusCode::OK).await;
        if let Some(call_id) = request.call_id() {
            if let Some(session) = self.session_by_call_id(call_id) {
                self.terminate_session(&session, "Remote hangup", CallState::Terminated)
                    .await;
            }
        }
    }

    pub(crate) async fn handle_incoming_cancel(&self, request: Request) {
        self.reply(&request, StatusCode::OK).await;
        let Some(call_id) = request.call_id() else {
            return;
        };
        let Some(session) = self.session_by_call_id(call_id) else {
            return;
        };
        if !session.state().is_early() {
            return;
        }
        let invite = session.invite.lock().clone();
        if let Some(invite) = invite {
            let local_tag = session.dialog.lock().local_tag.clone();
            let terminated =
                ResponseBuilder::reply_to(&invite, StatusCode::REQUEST_TERMINATED)
                    .to_tag(&local_tag)
                    .build();
            let _ = self.send_message(terminated.into()).await;
        }
        self.terminate_session(&session, "Remote cancelled", CallState::Terminated)
            .await;
    }

    /// Drive the outgoing-call state machine from INVITE responses.
    pub(crate) async fn handle_invite_response(
        &self,
        session: Arc<Session>,
        response: Response,
    ) {
        if session.state().is_terminal() {
            return;
        }

        // Re-INVITE responses (hold/unhold) only need an ACK and the
        // refreshed remote description.
        if session.answered_at.lock().is_some() {
            if response.status.is_success() {
                session.dialog.lock().confirm(
                    response
                        .headers
                        .to_address()
                        .ok()
                        .and_then(|to| to.tag().map(|t| t.to_string())),
                    response.headers.contact_address().map(|c| c.uri),
                );
                let ack = self.build_ack(&session, &response, true);
                let _ = self.send_message(ack.into()).await;
                if let Some(media) = session.media_session() {
                    if !response.body.is_empty() {
                        let _ = media.set_remote_description(response.body_str()).await;
                    }
                }
            } else if response.status.is_final() {
                let ack = self.build_ack(&session, &response, false);
                let _ = self.send_message(ack.into()).await;
            }
            return;
        }

        match response.status.code() {
            100 => {
                if session.state() == CallState::Initiating {
                    session.set_state(CallState::Calling);
                    self.emit_state(&session, CallState::Calling);
                }
            }
            180 => {
                session.set_state(CallState::Ringing);
                self.emit_state(&session, CallState::Ringing);
                self.notify_attended_ringing(&session).await;
            }
            183 => {
                session.set_state(CallState::Connecting);
                self.emit_state(&session, CallState::Connecting);
            }
            code if response.status.is_success() => {
                session.dialog.lock().confirm(
                    response
                        .headers
                        .to_address()
                        .ok()
                        .and_then(|to| to.tag().map(|t| t.to_string())),
                    response.headers.contact_address().map(|c| c.uri),
                );
                let ack = self.build_ack(&session, &response, true);
                let _ = self.send_message(ack.into()).await;

                if let Some(media) = session.media_session() {
                    if !response.body.is_empty() {
                        if let Err(e) =
                            media.set_remote_description(response.body_str()).await
                        {
                            warn!(error = %e, "remote description rejected");
                        }
                    }
                }

                session.timers.lock().cancel_all();
                *session.answered_at.lock() = Some(Utc::now());
                session.set_state(CallState::Established);
                self.emit_state(&session, CallState::Established);
                self.inner.bus.emit(ClientEvent::SessionAnswered {
                    session_id: session.id.clone(),
                    line: session.line,
                });
                debug!(session = %session.id, code, "call established");
                self.notify_attended_answered(&session).await;
            }
            401 | 407 if !session.auth_retried.swap(true, Ordering::SeqCst) => {
                let ack = self.build_ack(&session, &response, false);
                let _ = self.send_message(ack.into()).await;
                if let Err(e) = self.retry_invite_with_auth(&session, &response).await {
                    self.terminate_session(
                        &session,
                        &format!("Authentication failed: {}", e),
                        CallState::Failed,
                    )
                    .await;
                }
            }
            code if response.status.is_final() => {
                let ack = self.build_ack(&session, &response, false);
                let _ = self.send_message(ack.into()).await;
                let reason = format!("{} {}", code, response.reason_phrase());
                self.terminate_session(&session, &reason, CallState::Failed)
                    .await;
                self.notify_attended_rejected(&session, &reason).await;
            }
            _ => {}
        }
    }

    async fn retry_invite_with_auth(
        &self,
        session: &Arc<Session>,
        challenge_response: &Response,
    ) -> ClientResult<()> {
        let config = self.inner.config.read().await.clone();
        let challenge = challenge_from(challenge_response)?;
        let credentials = DigestCredentials::new(&config.username, &config.password);

        let mut invite = session
            .invite
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Internal {
                message: "outgoing session without stored INVITE".to_string(),
            })?;

        let authorization =
            credentials.respond(&challenge, &Method::Invite, &invite.uri.to_string());
        let auth_header = if challenge_response.status.code() == 407 {
            HeaderName::ProxyAuthorization
        } else {
            HeaderName::Authorization
        };

        let cseq = session.dialog.lock().next_cseq();
        invite.headers.set(
            HeaderName::Via,
            format!(
                "SIP/2.0/WSS {};branch={}",
                self.inner.local_host,
                generate_branch()
            ),
        );
        invite.headers.set(
            HeaderName::CSeq,
            softline_sip_core::CSeq::new(cseq, Method::Invite).to_string(),
        );
        invite.headers.set(auth_header, authorization);

        *session.invite.lock() = Some(invite.clone());
        self.send_message(invite.into()).await
    }

    // ===== helpers =====

    pub(crate) fn emit_state(&self, session: &Arc<Session>, state: CallState) {
        self.inner.bus.emit(ClientEvent::SessionStateChanged {
            session_id: session.id.clone(),
            line: session.line,
            state,
        });
    }

    pub(crate) fn contact_address(&self, user: &str) -> Address {
        Address::new(
            SipUri::new(user, &self.inner.local_host).with_param("transport", "ws"),
        )
    }

    /// An in-dialog request with the dialog's identifiers and a fresh
    /// branch and CSeq.
    pub(crate) fn build_in_dialog_request(
        &self,
        session: &Arc<Session>,
        method: Method,
    ) -> Request {
        let mut dialog = session.dialog.lock();
        let cseq = dialog.next_cseq();
        RequestBuilder::new(method.clone(), dialog.request_uri())
            .via(&self.inner.local_host, "WSS")
            .from(dialog.local_address())
            .to(dialog.remote_address())
            .call_id(dialog.call_id.clone())
            .cseq(cseq, method)
            .max_forwards(70)
            .user_agent(user_agent_string())
            .build()
    }

    fn build_ack(&self, session: &Arc<Session>, response: &Response, success: bool) -> Request {
        let dialog = session.dialog.lock();
        let seq = response.cseq().map(|c| c.seq).unwrap_or(dialog.local_cseq);
        if success {
            // In-dialog ACK for a 2xx, routed to the peer's Contact.
            RequestBuilder::new(Method::Ack, dialog.request_uri())
                .via(&self.inner.local_host, "WSS")
                .from(dialog.local_address())
                .to(dialog.remote_address())
                .call_id(dialog.call_id.clone())
                .cseq(seq, Method::Ack)
                .max_forwards(70)
                .build()
        } else {
            // Transaction-level ACK for an error final: same branch as the
            // INVITE, To taken from the response.
            let invite = session.invite.lock().clone();
            let branch = invite
                .as_ref()
                .and_then(|i| i.headers.get(&HeaderName::Via))
                .and_then(extract_branch)
                .unwrap_or_else(generate_branch);
            let uri = invite
                .as_ref()
                .map(|i| i.uri.clone())
                .unwrap_or_else(|| dialog.request_uri());
            let to = response
                .headers
                .get(&HeaderName::To)
                .map(|v| v.to_string())
                .unwrap_or_else(|| dialog.remote_address().to_string());
            let mut request = RequestBuilder::new(Method::Ack, uri)
                .via_with_branch(&self.inner.local_host, "WSS", &branch)
                .from(dialog.local_address())
                .call_id(dialog.call_id.clone())
                .cseq(seq, Method::Ack)
                .max_forwards(70)
                .build();
            request.headers.set(HeaderName::To, to);
            request
        }
    }

    async fn send_cancel(&self, session: &Arc<Session>) -> ClientResult<()> {
        let (invite, dialog_snapshot) = {
            let invite = session.invite.lock().clone();
            let dialog = session.dialog.lock().clone();
            (invite, dialog)
        };
        let invite = invite.ok_or_else(|| ClientError::Internal {
            message: "cancel without stored INVITE".to_string(),
        })?;
        let branch = invite
            .headers
            .get(&HeaderName::Via)
            .and_then(extract_branch)
            .unwrap_or_else(generate_branch);
        let seq = invite.cseq().map(|c| c.seq).unwrap_or(1);

        let mut cancel = RequestBuilder::new(Method::Cancel, invite.uri.clone())
            .via_with_branch(&self.inner.local_host, "WSS", &branch)
            .from(dialog_snapshot.local_address())
            .call_id(dialog_snapshot.call_id.clone())
            .cseq(seq, Method::Cancel)
            .max_forwards(70)
            .build();
        // CANCEL carries the To of the INVITE, untagged.
        if let Some(to) = invite.headers.get(&HeaderName::To) {
            cancel.headers.set(HeaderName::To, to);
        }
        self.send_message(cancel.into()).await
    }

    fn start_no_answer_timer(&self, session: &Arc<Session>, timeout: Duration) {
        let client = self.clone();
        let id = session.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Ok(session) = client.session_checked(&id) else {
                return;
            };
            if session.state().is_early() {
                info!(session = %id, "no answer; cancelling");
                let _ = client.send_cancel(&session).await;
                client
                    .terminate_session(&session, "No answer", CallState::Terminated)
                    .await;
            }
        });
        session.timers.lock().no_answer = Some(handle);
    }
}

pub(crate) fn build_target_uri(target: &str, domain: &str) -> ClientResult<SipUri> {
    if target.is_empty() {
        return Err(ClientError::InvalidTarget {
            target: target.to_string(),
        });
    }
    if target.contains('@') || target.starts_with("sip:") || target.starts_with("sips:") {
        let candidate = if target.starts_with("sip:") || target.starts_with("sips:") {
            target.to_string()
        } else {
            format!("sip:{}", target)
        };
        return candidate
            .parse()
            .map_err(|_| ClientError::InvalidTarget {
                target: target.to_string(),
            });
    }
    if target.contains(char::is_whitespace) {
        return Err(ClientError::InvalidTarget {
            target: target.to_string(),
        });
    }
    Ok(SipUri::new(target, domain))
}

fn extract_branch(via: &str) -> Option<String> {
    via.split(';')
        .find_map(|p| p.trim().strip_prefix("branch="))
        .map(|b| b.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_uri_building() {
        let uri = build_target_uri("2000", "pbx.example.com").unwrap();
        assert_eq!(uri.to_string(), "sip:2000@pbx.example.com");

        let uri = build_target_uri("bob@other.example.com", "pbx.example.com").unwrap();
        assert_eq!(uri.host, "other.example.com");

        assert!(build_target_uri("", "pbx.example.com").is_err());
        assert!(build_target_uri("20 00", "pbx.example.com").is_err());
    }

    #[test]
    fn branch_extraction() {
        assert_eq!(
            extract_branch("SIP/2.0/WSS a.invalid;branch=z9hG4bKabc").as_deref(),
            Some("z9hG4bKabc")
        );
        assert!(extract_branch("SIP/2.0/WSS a.invalid").is_none());
    }
}
