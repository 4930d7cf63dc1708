use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use jarvis_voice::audio::{pcm16_to_le_bytes, AudioFrame};
use jarvis_voice::realtime::{
    ConnectionState, ControlCommand, Inbound, RealtimeClient, RealtimeConfig, StreamEvent,
    Transport, TransportEvent, TransportMessage,
};

fn config(url: String, attempts: u32) -> RealtimeConfig {
    RealtimeConfig {
        url,
        api_key: "sk-test".into(),
        connect_timeout: Duration::from_secs(5),
        connect_attempts: attempts,
        ..RealtimeConfig::default()
    }
}

async fn next(rx: &mut mpsc::Receiver<TransportMessage>) -> TransportMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
}

#[tokio::test]
async fn streams_audio_and_decodes_response_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut auth = None;
        let mut path = String::new();
        let mut ws = accept_hdr_async(tcp, |req: &Request, resp: Response| {
            auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            path = req.uri().to_string();
            Ok(resp)
        })
        .await
        .unwrap();

        let mut received: Vec<Value> = Vec::new();
        while received.len() < 3 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => received.push(serde_json::from_str(&text).unwrap()),
                Some(Ok(_)) => {}
                other => panic!("client went away early: {:?}", other),
            }
        }

        let audio = BASE64.encode(pcm16_to_le_bytes(&[7, -7]));
        for event in [
            json!({"type": "session.updated", "session": {}}),
            json!({"type": "response.created", "response": {"id": "resp_1", "status": "in_progress"}}),
            json!({"type": "response.audio_transcript.delta", "response_id": "resp_1", "delta": "Hel"}),
            json!({"type": "response.audio.delta", "response_id": "resp_1", "delta": audio}),
            json!({"type": "something.new"}),
            json!({
                "type": "response.done",
                "response": {
                    "id": "resp_1",
                    "status": "completed",
                    "output": [{"content": [{"type": "audio", "transcript": "Hello"}]}],
                },
            }),
        ] {
            ws.send(Message::Text(event.to_string().into())).await.unwrap();
        }

        // Wait for the client to close.
        let mut closed = false;
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        (auth, path, received, closed)
    });

    let (tx, mut rx) = mpsc::channel(32);
    let mut client = RealtimeClient::new(config(format!("ws://{}/v1/realtime", addr), 1), tx);
    client.connect().unwrap();
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert!(matches!(
        client.send_audio_frame(&AudioFrame::new(vec![1])),
        Err(jarvis_voice::Error::NotConnected)
    ));

    let connected = next(&mut rx).await;
    assert_eq!(connected.event, TransportEvent::Connected);
    assert_eq!(connected.connection, client.connection());
    assert_eq!(client.state(), ConnectionState::Connected);

    client
        .send_audio_frame(&AudioFrame::new(vec![1, -2, 3]))
        .unwrap();
    client.send_control(ControlCommand::CreateResponse).unwrap();

    let mut events: Vec<TransportEvent> = Vec::new();
    for _ in 0..4 {
        events.push(next(&mut rx).await.event);
    }
    assert_eq!(
        events,
        vec![
            TransportEvent::Stream(Inbound {
                response_id: Some("resp_1".into()),
                event: StreamEvent::ResponseStarted,
            }),
            TransportEvent::Stream(Inbound {
                response_id: Some("resp_1".into()),
                event: StreamEvent::TranscriptDelta { text: "Hel".into() },
            }),
            TransportEvent::Stream(Inbound {
                response_id: Some("resp_1".into()),
                event: StreamEvent::AudioDelta { pcm: vec![7, -7] },
            }),
            TransportEvent::Stream(Inbound {
                response_id: Some("resp_1".into()),
                event: StreamEvent::TurnCompleted {
                    final_transcript: "Hello".into(),
                    final_audio: None,
                },
            }),
        ]
    );

    client.disconnect();
    assert_ne!(client.state(), ConnectionState::Connected);

    let (auth, path, received, closed) = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    assert!(path.ends_with("/v1/realtime?model=gpt-4o-realtime-preview"));
    assert_eq!(received[0]["type"], "session.update");
    assert_eq!(received[0]["session"]["input_audio_format"], "pcm16");
    assert!(received[0]["session"]["turn_detection"].is_null());
    assert_eq!(received[1]["type"], "input_audio_buffer.append");
    assert_eq!(
        received[1]["audio"],
        BASE64.encode(pcm16_to_le_bytes(&[1, -2, 3]))
    );
    assert_eq!(received[2]["type"], "response.create");
    assert!(closed);

    // A deliberate close reports nothing.
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn refused_connection_reports_error_then_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, mut rx) = mpsc::channel(8);
    let mut client = RealtimeClient::new(config(format!("ws://{}/v1/realtime", addr), 1), tx);
    client.connect().unwrap();

    let first = next(&mut rx).await;
    assert!(matches!(
        first.event,
        TransportEvent::Stream(Inbound {
            event: StreamEvent::Error { .. },
            ..
        })
    ));
    assert!(matches!(next(&mut rx).await.event, TransportEvent::Closed { .. }));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn rejected_key_is_not_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let _ = accept_hdr_async(tcp, |_: &Request, _: Response| {
                let mut reject = ErrorResponse::new(Some("invalid api key".into()));
                *reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
                Err(reject)
            })
            .await;
        }
    });

    let (tx, mut rx) = mpsc::channel(8);
    let mut client = RealtimeClient::new(config(format!("ws://{}/v1/realtime", addr), 3), tx);
    client.connect().unwrap();

    // A retry would wait at least 800 ms first.
    let first = timeout(Duration::from_millis(700), rx.recv())
        .await
        .expect("authentication failure was retried")
        .unwrap();
    match first.event {
        TransportEvent::Stream(Inbound {
            event: StreamEvent::Error { message },
            ..
        }) => assert!(message.contains("authentication failed"), "{}", message),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn missing_key_fails_synchronously() {
    let (tx, _rx) = mpsc::channel(8);
    let mut client = RealtimeClient::new(
        RealtimeConfig {
            api_key: String::new(),
            ..RealtimeConfig::default()
        },
        tx,
    );
    assert!(matches!(client.connect(), Err(jarvis_voice::Error::Config(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
