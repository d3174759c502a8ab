//! End-to-end scenarios driven through the mock transport.
//!
//! Each test scripts the server side of a SIP exchange: the client's
//! outbound messages are captured from the mock, responses and requests
//! are injected back, and the observable contract is checked through the
//! event bus and the public query surface.

use softline_client_core::audio::device::NullAudioSink;
use softline_client_core::audio::tones::ToneEngine;
use softline_client_core::lines::LineManager;
use softline_client_core::media::{MediaOp, NullMediaFactory};
use softline_client_core::{
    CallOptions, CallState, ClientError, ClientEvent, RegistrationState, SessionId, SipConfig,
    SoftphoneClient,
};
use softline_sip_core::{
    Address, HeaderName, Message, Method, Request, RequestBuilder, Response, ResponseBuilder,
    SessionDescription, SipUri, StatusCode,
};
use softline_sip_transport::mock::{MockTransportFactory, MockTransportHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(3);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

struct Harness {
    client: SoftphoneClient,
    factory: Arc<MockTransportFactory>,
    media: Arc<NullMediaFactory>,
    handle: MockTransportHandle,
    events: broadcast::Receiver<ClientEvent>,
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    what: &str,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

async fn expect_request(handle: &MockTransportHandle, method: Method) -> Request {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = handle
            .next_sent(remaining)
            .await
            .unwrap_or_else(|| panic!("no {} sent", method));
        if let Message::Request(request) = message {
            if request.method == method {
                return request;
            }
        }
    }
}

fn ok_with_tag(request: &Request, tag: &str) -> Response {
    ResponseBuilder::reply_to(request, StatusCode::OK)
        .to_tag(tag)
        .build()
}

fn answer_response(invite: &Request, tag: &str) -> Response {
    let sdp = SessionDescription::audio_offer("198.51.100.7", 20000).to_string();
    ResponseBuilder::reply_to(invite, StatusCode::OK)
        .to_tag(tag)
        .contact(Address::new(SipUri::new("peer", "198.51.100.7")))
        .body("application/sdp", sdp.into_bytes())
        .build()
}

fn incoming_invite(from_user: &str, call_id: &str) -> Request {
    let sdp = SessionDescription::audio_offer("198.51.100.5", 10000).to_string();
    RequestBuilder::new(Method::Invite, SipUri::new("1001", "pbx.example.com"))
        .via("pbx.example.com", "WSS")
        .from(Address::new(SipUri::new(from_user, "pbx.example.com")).with_tag("rtag"))
        .to(Address::new(SipUri::new("1001", "pbx.example.com")))
        .call_id(call_id)
        .cseq(1, Method::Invite)
        .contact(Address::new(SipUri::new(from_user, "pbx.example.com")))
        .body("application/sdp", sdp.into_bytes())
        .build()
}

fn in_dialog_bye(invite_200_to_tag: &str, remote_user: &str, call_id: &str) -> Request {
    RequestBuilder::new(Method::Bye, SipUri::new("1001", "pbx.example.com"))
        .via("pbx.example.com", "WSS")
        .from(Address::new(SipUri::new(remote_user, "pbx.example.com")).with_tag(invite_200_to_tag))
        .to(Address::new(SipUri::new("1001", "pbx.example.com")))
        .call_id(call_id)
        .cseq(2, Method::Bye)
        .build()
}

async fn start_registered(configure: impl FnOnce(SipConfig) -> SipConfig) -> Harness {
    init_tracing();
    let factory = Arc::new(MockTransportFactory::new());
    let handle = factory.push("mock-pbx").await;
    let media = Arc::new(NullMediaFactory::new());
    let config = configure(SipConfig::new(
        "pbx.example.com",
        "1001",
        "secret",
        "pbx.example.com",
    ));

    let client = SoftphoneClient::builder(config)
        .transport_factory(factory.clone())
        .media_factory(media.clone())
        .build();
    let mut events = client.subscribe();

    client.create_user_agent().await.expect("user agent");

    // Registration fires automatically shortly after the transport opens.
    let register = expect_request(&handle, Method::Register).await;
    handle.inject(ok_with_tag(&register, "reg-tag").into()).await;
    wait_for(&mut events, "Registered", |e| {
        matches!(e, ClientEvent::Registered)
    })
    .await;
    assert_eq!(
        client.registration_state().await,
        RegistrationState::Registered
    );

    Harness {
        client,
        factory,
        media,
        handle,
        events,
    }
}

/// Drive an outgoing call to established and return (session, invite).
async fn establish_outgoing(h: &mut Harness, target: &str, peer_tag: &str) -> (SessionId, Request) {
    let session = h
        .client
        .make_call(target, CallOptions::default())
        .await
        .expect("make_call");
    let invite = expect_request(&h.handle, Method::Invite).await;
    h.handle
        .inject(answer_response(&invite, peer_tag).into())
        .await;
    wait_for(&mut h.events, "SessionAnswered", |e| {
        matches!(e, ClientEvent::SessionAnswered { session_id, .. } if *session_id == session)
    })
    .await;
    // The client ACKs the 200.
    expect_request(&h.handle, Method::Ack).await;
    (session, invite)
}

// ===== S1: outgoing call happy path =====

#[tokio::test]
async fn outgoing_call_happy_path() {
    let mut h = start_registered(|c| c).await;

    let session = h
        .client
        .make_call("2000", CallOptions::default())
        .await
        .unwrap();

    let created = wait_for(&mut h.events, "SessionCreated", |e| {
        matches!(e, ClientEvent::SessionCreated { .. })
    })
    .await;
    if let ClientEvent::SessionCreated { session: info } = created {
        assert_eq!(info.line, 1);
        assert_eq!(info.state, CallState::Initiating);
        assert_eq!(info.remote_number, "2000");
    }

    let invite = expect_request(&h.handle, Method::Invite).await;
    assert_eq!(invite.uri.to_string(), "sip:2000@pbx.example.com");
    assert!(invite.body_str().contains("m=audio"));

    h.handle
        .inject(
            ResponseBuilder::reply_to(&invite, StatusCode::TRYING)
                .build()
                .into(),
        )
        .await;
    wait_for(&mut h.events, "calling state", |e| {
        matches!(
            e,
            ClientEvent::SessionStateChanged {
                state: CallState::Calling,
                ..
            }
        )
    })
    .await;

    h.handle
        .inject(answer_response(&invite, "peer1").into())
        .await;
    wait_for(&mut h.events, "established state", |e| {
        matches!(
            e,
            ClientEvent::SessionStateChanged {
                state: CallState::Established,
                ..
            }
        )
    })
    .await;
    wait_for(&mut h.events, "SessionAnswered", |e| {
        matches!(e, ClientEvent::SessionAnswered { .. })
    })
    .await;
    expect_request(&h.handle, Method::Ack).await;

    h.client.hangup_call(Some(session.clone())).await.unwrap();
    expect_request(&h.handle, Method::Bye).await;
    let terminated = wait_for(&mut h.events, "SessionTerminated", |e| {
        matches!(e, ClientEvent::SessionTerminated { .. })
    })
    .await;
    if let ClientEvent::SessionTerminated { reason, .. } = terminated {
        assert_eq!(reason, "User requested");
    }

    let stats = h.client.stats();
    assert_eq!(stats.total_calls, 1);
    assert_eq!(stats.outgoing_calls, 1);
    assert_eq!(stats.missed_calls, 0);
    assert_eq!(stats.active_calls, 0);
    assert!(h.client.list_calls().is_empty());
}

// ===== S2: incoming with call waiting =====

#[tokio::test]
async fn incoming_call_waits_without_stealing_the_line() {
    let mut h = start_registered(|c| c).await;

    let tones = Arc::new(ToneEngine::new(Arc::new(NullAudioSink)));
    let lines = LineManager::new(h.client.bus().clone(), Arc::new(h.client.clone()), tones);
    lines.start();

    let (session_a, _invite) = establish_outgoing(&mut h, "2000", "pa").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lines.selected_line(), Some(1));

    h.handle
        .inject(incoming_invite("3000", "cw-call@pbx").into())
        .await;

    let incoming = wait_for(&mut h.events, "IncomingCall", |e| {
        matches!(e, ClientEvent::IncomingCall { .. })
    })
    .await;
    let incoming_id = match incoming {
        ClientEvent::IncomingCall { session } => {
            assert_eq!(session.line, 2);
            assert_eq!(session.state, CallState::Ringing);
            session.session_id
        }
        _ => unreachable!(),
    };

    // 180 went back to the server.
    let sent = h.handle.drain_sent().await;
    assert!(sent.iter().any(|m| matches!(
        m,
        Message::Response(r) if r.status == StatusCode::RINGING
    )));

    // Selection stays on line 1 until the user clicks line 2.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(lines.selected_line(), Some(1));

    // Switching lines holds the active call first.
    lines.select_line(2).await.unwrap();
    wait_for(&mut h.events, "hold on switch", |e| {
        matches!(
            e,
            ClientEvent::SessionModified {
                session_id,
                action: softline_client_core::events::HoldAction::Hold,
            } if *session_id == session_a
        )
    })
    .await;
    assert_eq!(lines.selected_line(), Some(2));

    h.client.answer_call(Some(incoming_id)).await.unwrap();
    wait_for(&mut h.events, "answered", |e| {
        matches!(e, ClientEvent::SessionAnswered { .. })
    })
    .await;
    lines.stop();
}

// ===== S3: attended transfer =====

#[tokio::test]
async fn attended_transfer_uses_consultation_dialog_in_replaces() {
    let mut h = start_registered(|c| c).await;

    let (original, _invite_a) = establish_outgoing(&mut h, "2000", "tag-a").await;

    let consultation = h
        .client
        .attended_transfer(&original, "4000")
        .await
        .expect("attended transfer");

    // Hold of the original goes out as a re-INVITE with a=inactive.
    let reinvite = expect_request(&h.handle, Method::Invite).await;
    assert!(reinvite.body_str().contains("a=inactive"));

    // Consultation INVITE.
    let invite_b = expect_request(&h.handle, Method::Invite).await;
    assert_eq!(invite_b.uri.to_string(), "sip:4000@pbx.example.com");
    let consult_call_id = invite_b.call_id().unwrap().to_string();
    let consult_from_tag = invite_b
        .headers
        .from_address()
        .unwrap()
        .tag()
        .unwrap()
        .to_string();

    h.handle
        .inject(
            ResponseBuilder::reply_to(&invite_b, StatusCode::RINGING)
                .to_tag("tag-b")
                .build()
                .into(),
        )
        .await;
    wait_for(&mut h.events, "attended progress ringing", |e| {
        matches!(
            e,
            ClientEvent::AttendedTransferProgress {
                status: softline_client_core::events::AttendedTransferStatus::Ringing,
                ..
            }
        )
    })
    .await;

    h.handle
        .inject(answer_response(&invite_b, "tag-b").into())
        .await;
    wait_for(&mut h.events, "attended answered", |e| {
        matches!(e, ClientEvent::AttendedTransferAnswered { .. })
    })
    .await;

    let client = h.client.clone();
    let original_for_task = original.clone();
    let complete = tokio::spawn(async move {
        client
            .complete_attended_transfer(&original_for_task, None)
            .await
    });

    let refer = expect_request(&h.handle, Method::Refer).await;
    let refer_to = refer.headers.get(&HeaderName::ReferTo).unwrap().to_string();
    assert!(refer_to.contains("sip:4000@pbx.example.com"));
    assert!(refer_to.contains("Replaces="));
    let encoded = softline_sip_core::types::uri::escape_header_value(&format!(
        "{};to-tag=tag-b;from-tag={}",
        consult_call_id, consult_from_tag
    ));
    assert!(
        refer_to.contains(&encoded),
        "Refer-To {:?} should embed {:?}",
        refer_to,
        encoded
    );

    h.handle
        .inject(
            ResponseBuilder::reply_to(&refer, StatusCode::ACCEPTED)
                .build()
                .into(),
        )
        .await;
    complete.await.unwrap().expect("completion accepted");

    wait_for(&mut h.events, "transfer completed", |e| {
        matches!(
            e,
            ClientEvent::TransferCompleted { success: true, .. }
        )
    })
    .await;

    // Both local legs end within the grace window.
    let mut terminated = 0;
    while terminated < 2 {
        let event = wait_for(&mut h.events, "session teardown", |e| {
            matches!(e, ClientEvent::SessionTerminated { .. })
        })
        .await;
        if let ClientEvent::SessionTerminated { session_id, .. } = event {
            assert!(session_id == original || session_id == consultation);
            terminated += 1;
        }
    }
    assert!(h.client.list_calls().is_empty());
}

// ===== S4: BLF presence =====

#[tokio::test]
async fn blf_batched_subscribe_with_failure_and_notify() {
    let mut h = start_registered(|c| c).await;

    // Script the presence server: 2004 is a bad address, others accept.
    let server = h.handle.clone();
    let call_ids: Arc<parking_lot::Mutex<HashMap<String, String>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let call_ids_srv = call_ids.clone();
    let responder = tokio::spawn(async move {
        loop {
            let Some(message) = server.next_sent(Duration::from_secs(5)).await else {
                break;
            };
            let Message::Request(request) = message else {
                continue;
            };
            if request.method != Method::Subscribe {
                continue;
            }
            let extension = request.uri.user.clone().unwrap_or_default();
            if extension == "2004" {
                server
                    .inject(
                        ResponseBuilder::reply_to(&request, StatusCode::NOT_FOUND)
                            .build()
                            .into(),
                    )
                    .await;
            } else {
                call_ids_srv
                    .lock()
                    .insert(extension, request.call_id().unwrap().to_string());
                server
                    .inject(ok_with_tag(&request, "sub-tag").into())
                    .await;
            }
        }
    });

    let extensions: Vec<String> = ["2001", "2002", "2003", "2004"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    h.client
        .batch_subscribe_blf(&extensions, 2)
        .await
        .unwrap();

    wait_for(&mut h.events, "failed subscription", |e| {
        matches!(e, ClientEvent::BlfSubscriptionFailed { extension, .. } if extension == "2004")
    })
    .await;

    let subs = h.client.blf_subscriptions();
    assert_eq!(subs.len(), 3);

    // Server reports 2002 on a confirmed call.
    let call_id = call_ids.lock().get("2002").unwrap().clone();
    let xml = r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="sip:2002@pbx.example.com">
  <dialog id="d1" direction="initiator">
    <state>confirmed</state>
    <remote><target uri="sip:9000@pbx.example.com"/></remote>
  </dialog>
</dialog-info>"#;
    let notify = RequestBuilder::new(Method::Notify, SipUri::new("1001", "pbx.example.com"))
        .via("pbx.example.com", "WSS")
        .from(Address::new(SipUri::new("2002", "pbx.example.com")).with_tag("sub-tag"))
        .to(Address::new(SipUri::new("1001", "pbx.example.com")).with_tag("loc"))
        .call_id(call_id)
        .cseq(1, Method::Notify)
        .event("dialog")
        .header(HeaderName::SubscriptionState, "active;expires=300")
        .body("application/dialog-info+xml", xml.as_bytes().to_vec())
        .build();
    h.handle.inject(notify.into()).await;

    let changed = wait_for(&mut h.events, "BlfStateChanged", |e| {
        matches!(e, ClientEvent::BlfStateChanged { extension, .. } if extension == "2002")
    })
    .await;
    if let ClientEvent::BlfStateChanged {
        state,
        remote_target,
        ..
    } = changed
    {
        assert_eq!(state, softline_client_core::BlfState::Busy);
        assert_eq!(remote_target.as_deref(), Some("sip:9000@pbx.example.com"));
    }

    responder.abort();
}

// ===== S5: transport loss and recovery =====

#[tokio::test]
async fn transport_loss_clears_state_and_recovery_rebuilds() {
    let mut h = start_registered(|c| c).await;

    // One live subscription so teardown is observable.
    let server = h.handle.clone();
    let responder = tokio::spawn(async move {
        while let Some(message) = server.next_sent(Duration::from_secs(5)).await {
            if let Message::Request(request) = message {
                if request.method == Method::Subscribe {
                    server.inject(ok_with_tag(&request, "st").into()).await;
                }
            }
        }
    });
    h.client.subscribe_blf("2002", None).await.unwrap();
    assert_eq!(h.client.blf_subscriptions().len(), 1);
    responder.abort();

    h.handle.drop_connection("network gone").await;

    wait_for(&mut h.events, "TransportDisconnected", |e| {
        matches!(e, ClientEvent::TransportDisconnected { .. })
    })
    .await;
    wait_for(&mut h.events, "Unregistered", |e| {
        matches!(e, ClientEvent::Unregistered)
    })
    .await;
    assert!(h.client.blf_subscriptions().is_empty());
    assert_eq!(
        h.client.registration_state().await,
        RegistrationState::Unregistered
    );

    // Recovery: a fresh transport is waiting, the controller rebuilds.
    let new_handle = h.factory.push("mock-pbx-2").await;
    let registrar = tokio::spawn({
        let new_handle = new_handle.clone();
        async move {
            while let Some(message) = new_handle.next_sent(Duration::from_secs(5)).await {
                if let Message::Request(request) = message {
                    if request.method == Method::Register {
                        new_handle
                            .inject(ok_with_tag(&request, "rt2").into())
                            .await;
                    }
                }
            }
        }
    });

    use softline_client_core::connectivity::{ConnectivitySnapshot, InternetStatus};
    use softline_client_core::recovery::RecoveryController;
    let controller = RecoveryController::new(
        h.client.bus().clone(),
        Arc::new(h.client.clone()),
        "1001",
    );
    controller.start();
    h.client.bus().emit(ClientEvent::ConnectivityChanged {
        snapshot: ConnectivitySnapshot {
            link_up: true,
            internet_status: InternetStatus::Up,
            sip_reachable: Some(true),
            ..ConnectivitySnapshot::default()
        },
    });

    wait_for(&mut h.events, "re-registered", |e| {
        matches!(e, ClientEvent::Registered)
    })
    .await;
    assert!(h.client.is_connected());
    assert_eq!(controller.attempt_count(), 0);
    controller.stop();
    registrar.abort();
}

// ===== S6: DTMF gating by hold =====

#[tokio::test]
async fn dtmf_rejected_on_hold_and_sent_after_resume() {
    let mut h = start_registered(|c| c).await;
    let (session, _invite) = establish_outgoing(&mut h, "2000", "pt").await;

    h.client.hold_call(&session).await.unwrap();
    let err = h.client.send_dtmf(&session, '5').await.unwrap_err();
    assert!(matches!(err, ClientError::SessionNotEstablished { .. }));

    h.client.unhold_call(&session).await.unwrap();
    h.client.send_dtmf(&session, '5').await.unwrap();
    let event = wait_for(&mut h.events, "DtmfSent", |e| {
        matches!(e, ClientEvent::DtmfSent { .. })
    })
    .await;
    if let ClientEvent::DtmfSent { tone, .. } = event {
        assert_eq!(tone, '5');
    }

    // The media session saw exactly one telephone-event.
    let media_sessions = h.media.sessions();
    let dtmf_count: usize = media_sessions
        .iter()
        .flat_map(|s| s.operations())
        .filter(|op| matches!(op, MediaOp::Dtmf('5')))
        .count();
    assert_eq!(dtmf_count, 1);
}

// ===== invariants =====

#[tokio::test]
async fn fourth_call_is_refused_everywhere() {
    let mut h = start_registered(|c| c).await;

    for target in ["2001", "2002", "2003"] {
        h.client
            .make_call(target, CallOptions::default())
            .await
            .unwrap();
        expect_request(&h.handle, Method::Invite).await;
    }
    assert_eq!(h.client.list_calls().len(), 3);

    // Outgoing: rejected locally.
    let err = h
        .client
        .make_call("2004", CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AllLinesBusy));

    // Incoming: refused with 486.
    h.handle
        .inject(incoming_invite("3000", "busy-call@pbx").into())
        .await;
    let deadline = Instant::now() + WAIT;
    let mut saw_busy = false;
    while Instant::now() < deadline && !saw_busy {
        for message in h.handle.drain_sent().await {
            if let Message::Response(response) = message {
                if response.status == StatusCode::BUSY_HERE {
                    saw_busy = true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(saw_busy, "expected 486 Busy Here");
    assert_eq!(h.client.list_calls().len(), 3);
}

#[tokio::test]
async fn mute_and_hold_round_trips_are_identities() {
    let mut h = start_registered(|c| c).await;
    let (session, _invite) = establish_outgoing(&mut h, "2000", "pt").await;

    let before = h.client.get_call(&session).unwrap();
    assert!(!before.muted);
    assert!(!before.on_hold);

    h.client.mute_call(&session).await.unwrap();
    assert!(h.client.get_call(&session).unwrap().muted);
    h.client.unmute_call(&session).await.unwrap();
    let after_mute = h.client.get_call(&session).unwrap();
    assert!(!after_mute.muted);
    assert_eq!(after_mute.state, CallState::Established);

    h.client.hold_call(&session).await.unwrap();
    let held = h.client.get_call(&session).unwrap();
    assert!(held.on_hold);
    assert_eq!(held.state, CallState::Hold);
    h.client.unhold_call(&session).await.unwrap();
    let resumed = h.client.get_call(&session).unwrap();
    assert!(!resumed.on_hold);
    assert_eq!(resumed.state, CallState::Established);
}

#[tokio::test]
async fn blf_subscribe_unsubscribe_restores_initial_state() {
    let mut h = start_registered(|c| c).await;

    let server = h.handle.clone();
    let responder = tokio::spawn(async move {
        while let Some(message) = server.next_sent(Duration::from_secs(5)).await {
            if let Message::Request(request) = message {
                if request.method == Method::Subscribe {
                    server.inject(ok_with_tag(&request, "st").into()).await;
                }
            }
        }
    });

    assert!(h.client.blf_subscriptions().is_empty());
    h.client.subscribe_blf("2005", None).await.unwrap();
    wait_for(&mut h.events, "BlfSubscribed", |e| {
        matches!(e, ClientEvent::BlfSubscribed { extension } if extension == "2005")
    })
    .await;
    assert_eq!(h.client.blf_subscriptions().len(), 1);

    h.client.unsubscribe_blf("2005").await.unwrap();
    wait_for(&mut h.events, "BlfUnsubscribed", |e| {
        matches!(e, ClientEvent::BlfUnsubscribed { extension } if extension == "2005")
    })
    .await;
    assert!(h.client.blf_subscriptions().is_empty());
    responder.abort();
}

#[tokio::test]
async fn dtmf_sequence_preserves_order_and_spacing() {
    let mut h = start_registered(|c| c).await;
    let (session, _invite) = establish_outgoing(&mut h, "2000", "pt").await;

    let pause = Duration::from_millis(120);
    let mut tones_seen: Vec<(char, Instant)> = Vec::new();

    let send = {
        let client = h.client.clone();
        let session = session.clone();
        tokio::spawn(async move {
            client
                .send_dtmf_sequence(&session, "19#", Some(pause), Some(Duration::from_millis(50)))
                .await
        })
    };

    while tones_seen.len() < 3 {
        let event = wait_for(&mut h.events, "DtmfSent", |e| {
            matches!(e, ClientEvent::DtmfSent { .. })
        })
        .await;
        if let ClientEvent::DtmfSent { tone, .. } = event {
            tones_seen.push((tone, Instant::now()));
        }
    }
    send.await.unwrap().unwrap();

    let tones: String = tones_seen.iter().map(|(t, _)| *t).collect();
    assert_eq!(tones, "19#");
    for pair in tones_seen.windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap >= pause - Duration::from_millis(20), "gap was {:?}", gap);
    }
}

#[tokio::test]
async fn remote_hangup_terminates_and_counts_missed_calls() {
    let mut h = start_registered(|c| c).await;

    // Unanswered incoming call cancelled by the peer counts as missed.
    h.handle
        .inject(incoming_invite("3000", "missed@pbx").into())
        .await;
    wait_for(&mut h.events, "IncomingCall", |e| {
        matches!(e, ClientEvent::IncomingCall { .. })
    })
    .await;

    let cancel = RequestBuilder::new(Method::Cancel, SipUri::new("1001", "pbx.example.com"))
        .via("pbx.example.com", "WSS")
        .from(Address::new(SipUri::new("3000", "pbx.example.com")).with_tag("rtag"))
        .to(Address::new(SipUri::new("1001", "pbx.example.com")))
        .call_id("missed@pbx")
        .cseq(1, Method::Cancel)
        .build();
    h.handle.inject(cancel.into()).await;

    let record = wait_for(&mut h.events, "history record", |e| {
        matches!(e, ClientEvent::CallHistory { .. })
    })
    .await;
    if let ClientEvent::CallHistory { record } = record {
        assert_eq!(record.status, softline_client_core::CallOutcome::Missed);
        assert_eq!(record.number, "3000");
    }
    assert_eq!(h.client.stats().missed_calls, 1);

    // Established call torn down by a remote BYE.
    let (session, _invite) = establish_outgoing(&mut h, "2000", "bt").await;
    let call_id = {
        let info = h.client.get_call(&session).unwrap();
        assert_eq!(info.state, CallState::Established);
        // The BYE needs the dialog's call-id; fish it from the INVITE.
        _invite.call_id().unwrap().to_string()
    };
    h.handle
        .inject(in_dialog_bye("bt", "2000", &call_id).into())
        .await;
    let terminated = wait_for(&mut h.events, "remote hangup", |e| {
        matches!(e, ClientEvent::SessionTerminated { session_id, .. } if *session_id == session)
    })
    .await;
    if let ClientEvent::SessionTerminated { reason, .. } = terminated {
        assert_eq!(reason, "Remote hangup");
    }
}

#[tokio::test]
async fn dtmf_unsupported_media_reports_properly() {
    let factory = Arc::new(MockTransportFactory::new());
    let handle = factory.push("mock").await;
    let media = Arc::new(NullMediaFactory::without_dtmf());
    let config = SipConfig::new("pbx.example.com", "1001", "secret", "pbx.example.com");
    let client = SoftphoneClient::builder(config)
        .transport_factory(factory)
        .media_factory(media)
        .build();
    let mut events = client.subscribe();
    client.create_user_agent().await.unwrap();
    let register = expect_request(&handle, Method::Register).await;
    handle.inject(ok_with_tag(&register, "rt").into()).await;
    wait_for(&mut events, "Registered", |e| {
        matches!(e, ClientEvent::Registered)
    })
    .await;

    let session = client.make_call("2000", CallOptions::default()).await.unwrap();
    let invite = expect_request(&handle, Method::Invite).await;
    handle.inject(answer_response(&invite, "tg").into()).await;
    wait_for(&mut events, "answered", |e| {
        matches!(e, ClientEvent::SessionAnswered { .. })
    })
    .await;

    let err = client.send_dtmf(&session, '1').await.unwrap_err();
    assert!(matches!(err, ClientError::DtmfUnsupported));
}

#[tokio::test]
async fn unknown_notify_is_accepted_and_forwarded() {
    let mut h = start_registered(|c| c).await;

    let notify = RequestBuilder::new(Method::Notify, SipUri::new("1001", "pbx.example.com"))
        .via("pbx.example.com", "WSS")
        .from(Address::new(SipUri::new("server", "pbx.example.com")).with_tag("s"))
        .to(Address::new(SipUri::new("1001", "pbx.example.com")).with_tag("l"))
        .call_id("odd-notify@pbx")
        .cseq(1, Method::Notify)
        .event("x-custom-package")
        .body("text/plain", b"hello".to_vec())
        .build();
    h.handle.inject(notify.into()).await;

    // Accepted with 200.
    let deadline = Instant::now() + WAIT;
    let mut saw_ok = false;
    while Instant::now() < deadline && !saw_ok {
        for message in h.handle.drain_sent().await {
            if let Message::Response(response) = message {
                if response.status == StatusCode::OK {
                    saw_ok = true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(saw_ok);

    let event = wait_for(&mut h.events, "NotifyReceived", |e| {
        matches!(e, ClientEvent::NotifyReceived { .. })
    })
    .await;
    if let ClientEvent::NotifyReceived { event, body } = event {
        assert_eq!(event, "x-custom-package");
        match body {
            softline_client_core::events::NotifyBody::Raw { body, .. } => {
                assert_eq!(body, "hello")
            }
            other => panic!("expected raw body, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn voicemail_summary_notify_is_parsed() {
    let mut h = start_registered(|c| c).await;

    let notify = RequestBuilder::new(Method::Notify, SipUri::new("1001", "pbx.example.com"))
        .via("pbx.example.com", "WSS")
        .from(Address::new(SipUri::new("vmail", "pbx.example.com")).with_tag("s"))
        .to(Address::new(SipUri::new("1001", "pbx.example.com")).with_tag("l"))
        .call_id("mwi@pbx")
        .cseq(1, Method::Notify)
        .event("message-summary")
        .body(
            "application/simple-message-summary",
            b"Messages-Waiting: yes\r\nVoice-Message: 2/8 (0/2)\r\n".to_vec(),
        )
        .build();
    h.handle.inject(notify.into()).await;

    let event = wait_for(&mut h.events, "voicemail notify", |e| {
        matches!(e, ClientEvent::NotifyReceived { event, .. } if event == "message-summary")
    })
    .await;
    if let ClientEvent::NotifyReceived { body, .. } = event {
        match body {
            softline_client_core::events::NotifyBody::Voicemail { summary } => {
                assert!(summary.messages_waiting);
                assert_eq!(summary.voice_new, 2);
                assert_eq!(summary.voice_old, 8);
            }
            other => panic!("expected voicemail body, got {:?}", other),
        }
    }
}
