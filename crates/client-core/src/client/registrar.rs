//! Registration lifecycle
//!
//! One registration per client, refreshed at half the TTL. 401/407 digest
//! challenges are answered once per request; a second challenge means the
//! credentials are wrong and the attempt fails.

use super::SoftphoneClient;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, RegistrationState};
use softline_sip_core::auth::{DigestChallenge, DigestCredentials};
use softline_sip_core::{
    builder::generate_call_id, Address, HeaderName, Method, RequestBuilder, Response, SipUri,
};
use std::time::Duration;
use tracing::{debug, info, warn};

impl SoftphoneClient {
    /// Register with the configured server. Idempotent against an attempt
    /// already in flight or an existing registration.
    pub async fn register(&self) -> ClientResult<()> {
        {
            let reg = self.inner.registration.read().await;
            if matches!(
                reg.state,
                RegistrationState::Registering | RegistrationState::Registered
            ) {
                debug!(state = ?reg.state, "register is a no-op");
                return Ok(());
            }
        }

        self.set_registration_state(RegistrationState::Registering)
            .await;

        let ttl = self.inner.config.read().await.register_ttl;
        match self.do_register(ttl).await {
            Ok(response) if response.status.is_success() => {
                {
                    let mut reg = self.inner.registration.write().await;
                    reg.state = RegistrationState::Registered;
                    reg.registered_at = Some(chrono::Utc::now());
                }
                self.inner.bus.emit(ClientEvent::RegistrationStateChanged {
                    state: RegistrationState::Registered,
                });
                self.inner.bus.emit(ClientEvent::Registered);
                self.schedule_registration_refresh(ttl);
                info!(ttl, "registered");
                Ok(())
            }
            Ok(response) => {
                let reason = format!(
                    "{} {}",
                    response.status.code(),
                    response.reason_phrase()
                );
                self.fail_registration(&reason).await;
                Err(ClientError::RegistrationFailed { reason })
            }
            Err(e) => {
                self.fail_registration(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Drop the registration. BLF subscriptions and sessions go first so
    /// the server never sees traffic from an unregistered binding.
    pub async fn unregister(&self) -> ClientResult<()> {
        {
            let reg = self.inner.registration.read().await;
            if matches!(
                reg.state,
                RegistrationState::Unregistered | RegistrationState::Unregistering
            ) {
                return Ok(());
            }
        }

        self.unsubscribe_all_blf().await;

        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().id.clone())
            .collect();
        for id in sessions {
            let _ = self.hangup_call(Some(id)).await;
        }

        self.set_registration_state(RegistrationState::Unregistering)
            .await;
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }

        if let Err(e) = self.do_register(0).await {
            warn!(error = %e, "unregister request failed; clearing state anyway");
        }

        {
            let mut reg = self.inner.registration.write().await;
            reg.state = RegistrationState::Unregistered;
            reg.registered_at = None;
        }
        self.inner.bus.emit(ClientEvent::RegistrationStateChanged {
            state: RegistrationState::Unregistered,
        });
        self.inner.bus.emit(ClientEvent::Unregistered);
        info!("unregistered");
        Ok(())
    }

    /// Build and send one REGISTER (with digest retry), returning the
    /// final response.
    pub(crate) async fn do_register(&self, expires: u32) -> ClientResult<Response> {
        let config = self.inner.config.read().await.clone();

        let (call_id, from_tag, cseq) = {
            let mut reg = self.inner.registration.write().await;
            if reg.call_id.is_none() {
                reg.call_id = Some(generate_call_id(&self.inner.local_host));
            }
            reg.cseq += 1;
            (
                reg.call_id.clone().unwrap_or_default(),
                reg.from_tag.clone(),
                reg.cseq,
            )
        };

        let identity = Address::new(SipUri::new(&config.username, &config.domain))
            .with_display_name(config.effective_display_name());
        let contact = Address::new(
            SipUri::new(config.effective_contact_name(), &self.inner.local_host)
                .with_param("transport", "ws"),
        );

        let request = RequestBuilder::new(Method::Register, SipUri::domain(&config.domain))
            .via(&self.inner.local_host, "WSS")
            .from(identity.clone().with_tag(from_tag.clone()))
            .to(identity)
            .call_id(call_id.clone())
            .cseq(cseq, Method::Register)
            .contact(contact)
            .max_forwards(70)
            .expires(expires)
            .user_agent(user_agent_string())
            .build();

        let response = self.send_request_await(request, "register").await?;
        if !response.status.is_auth_challenge() {
            return Ok(response);
        }

        // Answer the challenge with a fresh CSeq on the same dialog.
        let challenge = challenge_from(&response)?;
        let credentials = DigestCredentials::new(&config.username, &config.password);
        let register_uri = SipUri::domain(&config.domain).to_string();
        let authorization =
            credentials.respond(&challenge, &Method::Register, &register_uri);
        let auth_header = if response.status.code() == 407 {
            HeaderName::ProxyAuthorization
        } else {
            HeaderName::Authorization
        };

        let cseq = {
            let mut reg = self.inner.registration.write().await;
            reg.cseq += 1;
            reg.cseq
        };

        let config2 = config.clone();
        let identity = Address::new(SipUri::new(&config2.username, &config2.domain))
            .with_display_name(config2.effective_display_name());
        let contact = Address::new(
            SipUri::new(config2.effective_contact_name(), &self.inner.local_host)
                .with_param("transport", "ws"),
        );
        let request = RequestBuilder::new(Method::Register, SipUri::domain(&config2.domain))
            .via(&self.inner.local_host, "WSS")
            .from(identity.clone().with_tag(from_tag))
            .to(identity)
            .call_id(call_id)
            .cseq(cseq, Method::Register)
            .contact(contact)
            .max_forwards(70)
            .expires(expires)
            .user_agent(user_agent_string())
            .header(auth_header, authorization)
            .build();

        self.send_request_await(request, "register").await
    }

    async fn set_registration_state(&self, state: RegistrationState) {
        self.inner.registration.write().await.state = state;
        self.inner
            .bus
            .emit(ClientEvent::RegistrationStateChanged { state });
    }

    async fn fail_registration(&self, reason: &str) {
        warn!(reason, "registration failed");
        {
            let mut reg = self.inner.registration.write().await;
            reg.state = RegistrationState::Failed;
            reg.registered_at = None;
        }
        self.inner.bus.emit(ClientEvent::RegistrationStateChanged {
            state: RegistrationState::Failed,
        });
        self.inner.bus.emit(ClientEvent::RegistrationFailed {
            reason: reason.to_string(),
        });
    }

    fn schedule_registration_refresh(&self, ttl: u32) {
        if let Some(previous) = self.inner.refresh_task.lock().take() {
            previous.abort();
        }
        let interval = Duration::from_secs((ttl as u64 / 2).max(30));
        let client = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if client.registration_state().await != RegistrationState::Registered {
                    break;
                }
                debug!("refreshing registration");
                match client.do_register(ttl).await {
                    Ok(response) if response.status.is_success() => {
                        client.inner.registration.write().await.registered_at =
                            Some(chrono::Utc::now());
                    }
                    Ok(response) => {
                        let reason = format!(
                            "{} {}",
                            response.status.code(),
                            response.reason_phrase()
                        );
                        client.fail_registration(&reason).await;
                        break;
                    }
                    Err(e) => {
                        client.fail_registration(&e.to_string()).await;
                        break;
                    }
                }
            }
        });
        *self.inner.refresh_task.lock() = Some(handle);
    }
}

pub(crate) fn user_agent_string() -> &'static str {
    concat!("softline/", env!("CARGO_PKG_VERSION"))
}

pub(crate) fn challenge_from(response: &Response) -> ClientResult<DigestChallenge> {
    let value = response
        .headers
        .get(&HeaderName::WwwAuthenticate)
        .or_else(|| response.headers.get(&HeaderName::ProxyAuthenticate))
        .ok_or_else(|| ClientError::RegistrationFailed {
            reason: "challenge response without challenge header".to_string(),
        })?;
    Ok(DigestChallenge::parse(value)?)
}
