//! Busy-lamp-field subscription engine
//!
//! One `Event: dialog` subscription per watched extension, batched on the
//! way up to avoid server bursts, retried from a failure set every 30 s,
//! refreshed before expiry, and torn down whenever the registration or the
//! transport goes away.

use crate::client::registrar::{challenge_from, user_agent_string};
use crate::client::SoftphoneClient;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, RegistrationState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use softline_sip_core::auth::DigestCredentials;
use softline_sip_core::bodies::dialog_info::{
    parse_dialog_info, DialogDirection, DialogInfo, DialogState,
};
use softline_sip_core::builder::{generate_call_id, generate_tag};
use softline_sip_core::{Address, HeaderName, Method, Request, RequestBuilder, SipUri};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Expiry requested on BLF subscriptions.
const SUBSCRIPTION_EXPIRES: u32 = 300;
/// Delay between subscribe batches.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(250);
/// Failure-set retry cadence.
const RETRY_INTERVAL: Duration = Duration::from_secs(30);
/// Extensions re-attempted per retry tick.
const RETRY_BATCH: usize = 2;

/// Presence of a watched extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlfState {
    Available,
    Ringing,
    Busy,
    #[serde(rename = "onhold")]
    OnHold,
    Unavailable,
    Unknown,
}

/// Map a parsed dialog-info document onto the presence lattice.
pub fn presence_from_dialog_info(info: &DialogInfo) -> BlfState {
    match &info.state {
        None => BlfState::Unknown,
        Some(DialogState::Early) | Some(DialogState::Trying) | Some(DialogState::Proceeding) => {
            if info.direction == Some(DialogDirection::Recipient) {
                BlfState::Ringing
            } else {
                BlfState::Busy
            }
        }
        Some(DialogState::Confirmed) => BlfState::Busy,
        Some(DialogState::Terminated) => BlfState::Available,
        Some(DialogState::Unknown(other)) => match other.as_str() {
            "onhold" | "hold" | "held" => BlfState::OnHold,
            _ => BlfState::Unknown,
        },
    }
}

/// Public snapshot of one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlfSubscription {
    pub extension: String,
    /// Optional embedder handle (a buddy-list id, a UI key).
    pub buddy: Option<String>,
    pub state: BlfState,
    pub remote_target: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

pub(crate) struct BlfEntry {
    pub extension: String,
    pub buddy: Option<String>,
    pub state: BlfState,
    pub remote_target: Option<String>,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub cseq: u32,
    pub expires: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl BlfEntry {
    fn snapshot(&self) -> BlfSubscription {
        BlfSubscription {
            extension: self.extension.clone(),
            buddy: self.buddy.clone(),
            state: self.state,
            remote_target: self.remote_target.clone(),
            last_success: self.last_success,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Subscription state owned by the client.
#[derive(Default)]
pub(crate) struct BlfStore {
    pub subs: DashMap<String, BlfEntry>,
    pub by_call_id: DashMap<String, String>,
    pub failed: parking_lot::Mutex<HashSet<String>>,
    /// Extensions the embedder wants watched, with their buddy handles.
    /// Survives transport loss so recovery can re-issue the set.
    pub desired: parking_lot::Mutex<std::collections::HashMap<String, Option<String>>>,
    pub maintenance: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlfStore {
    /// Drop the live dialogs. The desired set stays; an explicit
    /// unsubscribe is what removes intent.
    pub fn clear(&self) {
        self.subs.clear();
        self.by_call_id.clear();
        self.failed.lock().clear();
    }

    pub fn stop_maintenance(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

impl SoftphoneClient {
    /// Subscribe presence for one extension. Idempotent by extension.
    pub async fn subscribe_blf(
        &self,
        extension: &str,
        buddy: Option<String>,
    ) -> ClientResult<()> {
        let config = self.inner.config.read().await.clone();
        if !config.enable_blf {
            return Err(ClientError::SubscribeFailed {
                extension: extension.to_string(),
                reason: "BLF disabled by configuration".to_string(),
            });
        }
        if self.registration_state().await != RegistrationState::Registered {
            return Err(ClientError::NotRegistered);
        }
        self.inner
            .blf
            .desired
            .lock()
            .insert(extension.to_string(), buddy.clone());
        if self.inner.blf.subs.contains_key(extension) {
            return Ok(());
        }

        let call_id = generate_call_id(&self.inner.local_host);
        let local_tag = generate_tag();

        let request = self.build_subscribe(
            &config,
            extension,
            &call_id,
            &local_tag,
            None,
            1,
            SUBSCRIPTION_EXPIRES,
            None,
        );

        let response = match self.send_request_await(request, "blf subscribe").await {
            Ok(response) if response.status.is_auth_challenge() => {
                let challenge = challenge_from(&response).map_err(|e| {
                    self.record_blf_failure(extension, &e.to_string())
                })?;
                let credentials =
                    DigestCredentials::new(&config.username, &config.password);
                let uri = SipUri::new(extension, &config.domain).to_string();
                let authorization =
                    credentials.respond(&challenge, &Method::Subscribe, &uri);
                let auth_header = if response.status.code() == 407 {
                    HeaderName::ProxyAuthorization
                } else {
                    HeaderName::Authorization
                };
                let retry = self.build_subscribe(
                    &config,
                    extension,
                    &call_id,
                    &local_tag,
                    None,
                    2,
                    SUBSCRIPTION_EXPIRES,
                    Some((auth_header, authorization)),
                );
                match self.send_request_await(retry, "blf subscribe").await {
                    Ok(response) => response,
                    Err(e) => return Err(self.record_blf_failure(extension, &e.to_string())),
                }
            }
            Ok(response) => response,
            Err(e) => return Err(self.record_blf_failure(extension, &e.to_string())),
        };

        if !response.status.is_success() {
            let reason = format!(
                "{} {}",
                response.status.code(),
                response.reason_phrase()
            );
            return Err(self.record_blf_failure(extension, &reason));
        }

        let remote_tag = response
            .headers
            .to_address()
            .ok()
            .and_then(|to| to.tag().map(|t| t.to_string()));
        let expires = response.headers.expires().unwrap_or(SUBSCRIPTION_EXPIRES);
        let cseq = response.cseq().map(|c| c.seq).unwrap_or(1);

        self.inner.blf.subs.insert(
            extension.to_string(),
            BlfEntry {
                extension: extension.to_string(),
                buddy,
                state: BlfState::Unknown,
                remote_target: None,
                call_id: call_id.clone(),
                local_tag,
                remote_tag,
                cseq,
                expires,
                last_success: Some(Utc::now()),
                consecutive_failures: 0,
            },
        );
        self.inner
            .blf
            .by_call_id
            .insert(call_id, extension.to_string());
        self.inner.blf.failed.lock().remove(extension);
        self.ensure_blf_maintenance();

        self.inner.bus.emit(ClientEvent::BlfSubscribed {
            extension: extension.to_string(),
        });
        debug!(extension, expires, "BLF subscribed");
        Ok(())
    }

    /// Drop the subscription for one extension. Idempotent.
    pub async fn unsubscribe_blf(&self, extension: &str) -> ClientResult<()> {
        self.inner.blf.desired.lock().remove(extension);
        self.inner.blf.failed.lock().remove(extension);
        let Some((_, entry)) = self.inner.blf.subs.remove(extension) else {
            return Ok(());
        };
        self.inner.blf.by_call_id.remove(&entry.call_id);

        // Expires: 0 is a courtesy; the server times the dialog out anyway.
        let config = self.inner.config.read().await.clone();
        let request = self.build_subscribe(
            &config,
            extension,
            &entry.call_id,
            &entry.local_tag,
            entry.remote_tag.as_deref(),
            entry.cseq + 1,
            0,
            None,
        );
        if let Err(e) = self.send_message(request.into()).await {
            debug!(extension, error = %e, "unsubscribe send failed");
        }

        self.inner.bus.emit(ClientEvent::BlfUnsubscribed {
            extension: extension.to_string(),
        });
        Ok(())
    }

    /// Subscribe a set of extensions `batch_size` at a time with a small
    /// delay between batches.
    pub async fn batch_subscribe_blf(
        &self,
        extensions: &[String],
        batch_size: usize,
    ) -> ClientResult<()> {
        let batch_size = batch_size.max(1);
        for (index, chunk) in extensions.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
            let results = join_all(
                chunk
                    .iter()
                    .map(|extension| self.subscribe_blf(extension, None)),
            )
            .await;
            for (extension, result) in chunk.iter().zip(results) {
                if let Err(e) = result {
                    debug!(extension = %extension, error = %e, "batch subscribe entry failed");
                }
            }
        }
        Ok(())
    }

    /// Snapshots of all current subscriptions.
    pub fn blf_subscriptions(&self) -> Vec<BlfSubscription> {
        self.inner
            .blf
            .subs
            .iter()
            .map(|e| e.value().snapshot())
            .collect()
    }

    /// Re-issue every desired subscription, in batches. The recovery path
    /// runs this after re-registration; the live dialog map is rebuilt
    /// from scratch.
    pub async fn resubscribe_blf(&self) -> ClientResult<()> {
        let desired: Vec<(String, Option<String>)> = self
            .inner
            .blf
            .desired
            .lock()
            .iter()
            .map(|(extension, buddy)| (extension.clone(), buddy.clone()))
            .collect();
        self.inner.blf.clear();
        for (index, chunk) in desired.chunks(RETRY_BATCH).enumerate() {
            if index > 0 {
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
            let results = join_all(
                chunk
                    .iter()
                    .map(|(extension, buddy)| self.subscribe_blf(extension, buddy.clone())),
            )
            .await;
            for ((extension, _), result) in chunk.iter().zip(results) {
                if let Err(e) = result {
                    debug!(extension = %extension, error = %e, "re-subscribe failed");
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe_all_blf(&self) {
        self.inner.blf.stop_maintenance();
        let extensions: Vec<String> = self
            .inner
            .blf
            .subs
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for extension in extensions {
            let _ = self.unsubscribe_blf(&extension).await;
        }
        self.inner.blf.desired.lock().clear();
        self.inner.blf.clear();
    }

    pub(crate) async fn handle_blf_notify(&self, request: &Request) {
        let body = request.body_str();
        let info = match parse_dialog_info(body) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "bad dialog-info body");
                return;
            }
        };

        // Match by subscription dialog first, falling back to the entity
        // attribute for servers that fork NOTIFYs oddly.
        let extension = request
            .call_id()
            .and_then(|call_id| self.inner.blf.by_call_id.get(call_id).map(|e| e.clone()))
            .or_else(|| {
                info.entity.as_ref().and_then(|entity| {
                    entity
                        .trim_start_matches("sip:")
                        .split('@')
                        .next()
                        .map(|user| user.to_string())
                })
            });
        let Some(extension) = extension else {
            debug!("dialog-info NOTIFY with no matching subscription");
            return;
        };

        let terminated = request
            .headers
            .subscription_state()
            .map(|s| s.eq_ignore_ascii_case("terminated"))
            .unwrap_or(false);

        let state = if terminated {
            BlfState::Unavailable
        } else {
            presence_from_dialog_info(&info)
        };

        if let Some(mut entry) = self.inner.blf.subs.get_mut(&extension) {
            entry.state = state;
            entry.remote_target = info.remote_target.clone();
            entry.last_success = Some(Utc::now());
        }
        if terminated {
            // Server ended the dialog; queue a fresh subscribe.
            if let Some((_, entry)) = self.inner.blf.subs.remove(&extension) {
                self.inner.blf.by_call_id.remove(&entry.call_id);
            }
            self.inner.blf.failed.lock().insert(extension.clone());
        }

        self.inner.bus.emit(ClientEvent::BlfStateChanged {
            extension,
            state,
            remote_target: info.remote_target,
        });
    }

    fn record_blf_failure(&self, extension: &str, reason: &str) -> ClientError {
        warn!(extension, reason, "BLF subscribe failed");
        self.inner.blf.failed.lock().insert(extension.to_string());
        self.ensure_blf_maintenance();
        self.inner.bus.emit(ClientEvent::BlfSubscriptionFailed {
            extension: extension.to_string(),
            reason: reason.to_string(),
        });
        ClientError::SubscribeFailed {
            extension: extension.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The retry/refresh sweep. Started lazily with the first
    /// subscription, stopped on teardown.
    fn ensure_blf_maintenance(&self) {
        let mut guard = self.inner.blf.maintenance.lock();
        if guard.is_some() {
            return;
        }
        let client = self.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETRY_INTERVAL).await;
                if client.registration_state().await != RegistrationState::Registered {
                    continue;
                }

                // Retry a small batch from the failure set.
                let retry: Vec<String> = {
                    let failed = client.inner.blf.failed.lock();
                    failed.iter().take(RETRY_BATCH).cloned().collect()
                };
                for extension in retry {
                    let buddy = client
                        .inner
                        .blf
                        .desired
                        .lock()
                        .get(&extension)
                        .cloned()
                        .flatten();
                    if let Err(e) = client.subscribe_blf(&extension, buddy).await {
                        debug!(extension = %extension, error = %e, "BLF retry failed");
                    }
                }

                // Refresh subscriptions past half their expiry.
                let stale: Vec<String> = client
                    .inner
                    .blf
                    .subs
                    .iter()
                    .filter(|e| {
                        e.value()
                            .last_success
                            .map(|t| {
                                let age = (Utc::now() - t).num_seconds();
                                age >= (e.value().expires as i64) / 2
                            })
                            .unwrap_or(true)
                    })
                    .map(|e| e.key().clone())
                    .collect();
                for extension in stale {
                    client.refresh_blf_subscription(&extension).await;
                }
            }
        }));
    }

    async fn refresh_blf_subscription(&self, extension: &str) {
        let Some((call_id, local_tag, remote_tag, cseq)) =
            self.inner.blf.subs.get(extension).map(|e| {
                (
                    e.call_id.clone(),
                    e.local_tag.clone(),
                    e.remote_tag.clone(),
                    e.cseq,
                )
            })
        else {
            return;
        };

        let config = self.inner.config.read().await.clone();
        let request = self.build_subscribe(
            &config,
            extension,
            &call_id,
            &local_tag,
            remote_tag.as_deref(),
            cseq + 1,
            SUBSCRIPTION_EXPIRES,
            None,
        );

        match self.send_request_await(request, "blf refresh").await {
            Ok(response) if response.status.is_success() => {
                if let Some(mut entry) = self.inner.blf.subs.get_mut(extension) {
                    entry.cseq = cseq + 1;
                    entry.last_success = Some(Utc::now());
                    entry.consecutive_failures = 0;
                }
            }
            Ok(response) => {
                let reason = format!(
                    "{} {}",
                    response.status.code(),
                    response.reason_phrase()
                );
                self.drop_to_failed(extension, &reason);
            }
            Err(e) => {
                self.drop_to_failed(extension, &e.to_string());
            }
        }
    }

    fn drop_to_failed(&self, extension: &str, reason: &str) {
        info!(extension, reason, "BLF subscription lost; will retry");
        if let Some((_, entry)) = self.inner.blf.subs.remove(extension) {
            self.inner.blf.by_call_id.remove(&entry.call_id);
        }
        let _ = self.record_blf_failure(extension, reason);
    }

    #[allow(clippy::too_many_arguments)]
    fn build_subscribe(
        &self,
        config: &crate::config::SipConfig,
        extension: &str,
        call_id: &str,
        local_tag: &str,
        remote_tag: Option<&str>,
        cseq: u32,
        expires: u32,
        auth: Option<(HeaderName, String)>,
    ) -> Request {
        let target = SipUri::new(extension, &config.domain);
        let identity = Address::new(SipUri::new(&config.username, &config.domain))
            .with_display_name(config.effective_display_name());
        let mut to = Address::new(target.clone());
        if let Some(tag) = remote_tag {
            to.set_tag(tag);
        }

        let mut builder = RequestBuilder::new(Method::Subscribe, target)
            .via(&self.inner.local_host, "WSS")
            .from(identity.with_tag(local_tag))
            .to(to)
            .call_id(call_id)
            .cseq(cseq, Method::Subscribe)
            .contact(self.contact_address(config.effective_contact_name()))
            .max_forwards(70)
            .event("dialog")
            .accept("application/dialog-info+xml")
            .expires(expires)
            .user_agent(user_agent_string());
        if let Some((name, value)) = auth {
            builder = builder.header(name, value);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(state: Option<DialogState>, direction: Option<DialogDirection>) -> DialogInfo {
        DialogInfo {
            entity: None,
            state,
            direction,
            remote_target: None,
            remote_identity: None,
        }
    }

    #[test]
    fn presence_mapping() {
        assert_eq!(
            presence_from_dialog_info(&info(Some(DialogState::Confirmed), None)),
            BlfState::Busy
        );
        assert_eq!(
            presence_from_dialog_info(&info(
                Some(DialogState::Early),
                Some(DialogDirection::Recipient)
            )),
            BlfState::Ringing
        );
        assert_eq!(
            presence_from_dialog_info(&info(
                Some(DialogState::Early),
                Some(DialogDirection::Initiator)
            )),
            BlfState::Busy
        );
        assert_eq!(
            presence_from_dialog_info(&info(Some(DialogState::Terminated), None)),
            BlfState::Available
        );
        assert_eq!(presence_from_dialog_info(&info(None, None)), BlfState::Unknown);
        assert_eq!(
            presence_from_dialog_info(&info(
                Some(DialogState::Unknown("onhold".to_string())),
                None
            )),
            BlfState::OnHold
        );
    }
}
