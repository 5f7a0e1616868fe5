//! Central system and charging station talking over loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use validator::Validate;

use common::*;
use ocppj::application::DispatcherConfig;
use ocppj::catalog::v16;
use ocppj::catalog::v16::core::{AuthorizeRequest, BootNotificationRequest, HeartbeatRequest};
use ocppj::domain::{Feature, Initiator, Profile};
use ocppj::infrastructure::ClientTimeouts;
use ocppj::{CentralSystem, ChargingStation, EndpointError, OcppErrorCode};

async fn start_csms(handler: Arc<RecordingCsms>) -> (CentralSystem, String) {
    let csms = CentralSystem::new(v16::registry());
    csms.register(v16::core::central_system(handler));
    let addr = csms.start("127.0.0.1:0").await.unwrap();
    (csms, format!("ws://{}", addr))
}

// ── Echo roundtrip ─────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_roundtrip_on_the_wire() {
    let (csms, _url) = start_csms(Arc::new(RecordingCsms::default())).await;
    let addr = csms.local_addr().await.unwrap();

    let mut ws = raw_connect(addr, "/CS001", "ocpp1.6").await;
    ws.send(Message::Text(r#"[2,"abc-1","Heartbeat",{}]"#.into()))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!([3, "abc-1", {"currentTime": "2024-01-01T00:00:00Z"}])
    );

    csms.stop().await;
}

#[tokio::test]
async fn heartbeat_roundtrip_through_the_station() {
    let handler = Arc::new(RecordingCsms::default());
    let (csms, url) = start_csms(Arc::clone(&handler)).await;

    let station = ChargingStation::builder("CS001", v16::registry())
        .id_generator(Arc::new(FixedId("abc-1")))
        .build();
    station.start(&url).await.unwrap();
    assert_eq!(station.negotiated_subprotocol().as_deref(), Some("ocpp1.6"));
    assert!(eventually(|| csms.is_connected("CS001")).await);

    let response = station.send_request(HeartbeatRequest {}).await.unwrap();
    assert_eq!(response.current_time, fixed_time());
    assert_eq!(handler.calls(), vec!["Heartbeat"]);

    // the single pending slot is free again
    let again = station.send_request(HeartbeatRequest {}).await.unwrap();
    assert_eq!(again.current_time, fixed_time());

    let info = csms.connection_info("CS001").unwrap();
    assert_eq!(info.subprotocol.as_deref(), Some("ocpp1.6"));
    assert!(!info.tls);

    station.stop().await;
    csms.stop().await;
}

// ── Busy / FIFO ────────────────────────────────────────────────

#[tokio::test]
async fn queued_requests_go_out_in_order() {
    let handler = Arc::new(RecordingCsms::with_boot_delay(Duration::from_millis(200)));
    let (csms, url) = start_csms(Arc::clone(&handler)).await;

    let station = ChargingStation::new("CS001", v16::registry());
    station.start(&url).await.unwrap();

    let (boot_tx, boot_rx) = tokio::sync::oneshot::channel();
    station
        .send_request_async(BootNotificationRequest::new("Vendor", "Model"), move |result| {
            let _ = boot_tx.send(result);
        })
        .unwrap();
    let authorize = station
        .send_request(AuthorizeRequest {
            id_tag: "TAG001".into(),
        })
        .await
        .unwrap();

    assert!(authorize.id_tag_info.status == v16::types::AuthorizationStatus::Accepted);
    assert!(boot_rx.await.unwrap().is_ok());
    assert_eq!(handler.calls(), vec!["BootNotification", "Authorize"]);

    station.stop().await;
    csms.stop().await;
}

#[tokio::test]
async fn second_request_is_rejected_when_busy() {
    let handler = Arc::new(RecordingCsms::with_boot_delay(Duration::from_millis(200)));
    let (csms, url) = start_csms(handler).await;

    let station = ChargingStation::builder("CS001", v16::registry())
        .dispatcher_config(DispatcherConfig::default().with_reject_when_busy(true))
        .build();
    station.start(&url).await.unwrap();

    let (boot_tx, boot_rx) = tokio::sync::oneshot::channel();
    station
        .send_request_async(BootNotificationRequest::new("Vendor", "Model"), move |result| {
            let _ = boot_tx.send(result);
        })
        .unwrap();
    let err = station
        .send_request_async(AuthorizeRequest { id_tag: "TAG001".into() }, |_| {})
        .unwrap_err();
    assert_eq!(err, EndpointError::Busy("CS001".into()));
    assert!(boot_rx.await.unwrap().is_ok());

    station.stop().await;
    csms.stop().await;
}

// ── Timeout ────────────────────────────────────────────────────

/// Answers every Heartbeat except the first.
async fn start_silent_once_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |_req: &Request, mut response: Response| {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
        let mut seen = 0;
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else { continue };
            seen += 1;
            if seen == 1 {
                continue;
            }
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            let reply = json!([3, frame[1], {"currentTime": "2024-01-01T00:00:00Z"}]);
            ws.send(Message::Text(reply.to_string())).await.unwrap();
        }
    });
    format!("ws://{}", addr)
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let url = start_silent_once_server().await;
    let station = ChargingStation::builder("CS001", v16::registry())
        .dispatcher_config(DispatcherConfig::default().with_request_timeout(Duration::from_millis(300)))
        .build();
    station.start(&url).await.unwrap();

    let err = station.send_request(HeartbeatRequest {}).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.code(), Some(OcppErrorCode::GenericError));

    let response = station.send_request(HeartbeatRequest {}).await.unwrap();
    assert_eq!(response.current_time, fixed_time());

    station.stop().await;
}

// ── Duplicate station id ───────────────────────────────────────

#[tokio::test]
async fn duplicate_station_id_is_closed_with_policy_violation() {
    let (csms, _url) = start_csms(Arc::new(RecordingCsms::default())).await;
    let addr = csms.local_addr().await.unwrap();

    let _first = raw_connect(addr, "/CS001", "ocpp1.6").await;
    assert!(eventually(|| csms.is_connected("CS001")).await);

    let mut second = raw_connect(addr, "/CS001", "ocpp1.6").await;
    let close = loop {
        let message = tokio::time::timeout(STEP, second.next())
            .await
            .unwrap()
            .expect("stream ended without close")
            .unwrap();
        if let Message::Close(frame) = message {
            break frame.expect("close frame without payload");
        }
    };
    assert_eq!(close.code, CloseCode::Policy);
    assert!(close.reason.contains("already exists"));
    assert_eq!(csms.connected_ids(), vec!["CS001".to_string()]);

    csms.stop().await;
}

// ── Forced disconnect and reconnect ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum LinkEvent {
    Disconnected { with_error: bool },
    Reconnected,
}

#[tokio::test]
async fn station_reconnects_after_server_disconnect() {
    let (csms, url) = start_csms(Arc::new(RecordingCsms::default())).await;

    let station = ChargingStation::builder("CS001", v16::registry())
        .timeouts(
            ClientTimeouts::default()
                .with_reconnect_backoff(Duration::from_millis(100), Duration::from_millis(500)),
        )
        .build();

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let log = Arc::clone(&events);
        station.set_disconnected_handler(move |error| {
            log.lock().unwrap().push(LinkEvent::Disconnected { with_error: error.is_some() })
        });
        let log = Arc::clone(&events);
        station.set_reconnected_handler(move || log.lock().unwrap().push(LinkEvent::Reconnected));
    }

    station.start(&url).await.unwrap();
    assert!(eventually(|| csms.is_connected("CS001")).await);

    assert!(csms.disconnect("CS001"));
    assert!(eventually(|| events.lock().unwrap().contains(&LinkEvent::Reconnected)).await);
    assert!(station.is_connected());
    assert!(eventually(|| csms.is_connected("CS001")).await);

    assert_eq!(
        *events.lock().unwrap(),
        vec![LinkEvent::Disconnected { with_error: true }, LinkEvent::Reconnected]
    );

    let response = station.send_request(HeartbeatRequest {}).await.unwrap();
    assert_eq!(response.current_time, fixed_time());

    station.stop().await;
    csms.stop().await;
}

// ── Unknown action ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct MadeUpRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct MadeUpResponse {}

ocppj::ocpp_request!(MadeUpRequest => MadeUpResponse, "MadeUpAction");

#[tokio::test]
async fn unknown_action_is_answered_with_not_implemented() {
    let (csms, url) = start_csms(Arc::new(RecordingCsms::default())).await;

    let registry = v16::registry().with_profile(Profile::new(
        "Custom",
        vec![Feature::of::<MadeUpRequest>(Initiator::ChargingStation)],
    ));
    let station = ChargingStation::builder("CS001", registry)
        .id_generator(Arc::new(FixedId("xyz")))
        .build();
    station.start(&url).await.unwrap();

    let err = station.send_request(MadeUpRequest {}).await.unwrap_err();
    match err {
        EndpointError::Ocpp(e) => {
            assert_eq!(e.code, OcppErrorCode::NotImplemented);
            assert_eq!(e.description, "no handler for action MadeUpAction");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // the pending entry for "xyz" is gone, so the id can be reused
    let response = station.send_request(HeartbeatRequest {}).await.unwrap();
    assert_eq!(response.current_time, fixed_time());

    station.stop().await;
    csms.stop().await;
}
