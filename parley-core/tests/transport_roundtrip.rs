use std::time::Duration;

use crossbeam_channel::Receiver;
use futures_util::{SinkExt, StreamExt};
use parley_core::capture::{AudioBlob, WAV_MIME};
use parley_core::transport::{self, ClientMessage, ReconnectPolicy, ServerMessage, TransportEvent};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        max_attempts: 2,
    }
}

async fn next_event(rx: &Receiver<TransportEvent>, timeout: Duration) -> Option<TransportEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(event) = rx.try_recv() {
            return Some(event);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn local_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{addr}/ws"))
}

#[tokio::test]
async fn audio_goes_out_and_replies_come_back() {
    let (listener, url) = local_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        let first = ws.next().await.expect("frame").expect("ok frame");
        let text = match first {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        };
        let json: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(json["type"], "audio");
        assert_eq!(json["mime"], WAV_MIME);

        ws.send(Message::Text("not json".into())).await.expect("send");
        ws.send(Message::Text(r#"{"type":"transcription","text":"hello"}"#.into()))
            .await
            .expect("send");
        ws.send(Message::Text(r#"{"type":"audio","audio":"AQID"}"#.into()))
            .await
            .expect("send");
        ws.close(None).await.expect("close");
    });

    let (tx, rx) = crossbeam_channel::unbounded();
    let (handle, task) = transport::spawn(url, fast_policy(), tx);
    let wait = Duration::from_secs(5);

    assert_eq!(next_event(&rx, wait).await, Some(TransportEvent::Opened));
    let blob = AudioBlob {
        bytes: vec![1u8; 512],
        mime: WAV_MIME.into(),
        duration: Duration::from_millis(500),
    };
    assert!(handle.send(ClientMessage::audio(&blob)));

    // The malformed frame is dropped without closing the connection.
    assert_eq!(
        next_event(&rx, wait).await,
        Some(TransportEvent::Message(ServerMessage::Transcription {
            text: "hello".into()
        }))
    );
    assert_eq!(
        next_event(&rx, wait).await,
        Some(TransportEvent::Message(ServerMessage::Audio {
            audio: "AQID".into()
        }))
    );
    assert_eq!(
        next_event(&rx, wait).await,
        Some(TransportEvent::Closed { clean: true })
    );

    // A clean close does not reconnect on its own.
    assert_eq!(next_event(&rx, Duration::from_millis(200)).await, None);

    server.await.expect("server task");
    handle.shutdown();
    tokio::time::timeout(wait, task)
        .await
        .expect("transport task ends")
        .expect("transport task joins");
}

#[tokio::test]
async fn unclean_drop_reconnects() {
    let (listener, url) = local_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = accept_async(stream).await.expect("handshake");
        drop(ws);

        let (stream, _) = listener.accept().await.expect("second accept");
        let mut ws = accept_async(stream).await.expect("second handshake");
        // Hold the connection until the client closes it.
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    });

    let (tx, rx) = crossbeam_channel::unbounded();
    let (handle, task) = transport::spawn(url, fast_policy(), tx);
    let wait = Duration::from_secs(5);

    assert_eq!(next_event(&rx, wait).await, Some(TransportEvent::Opened));
    assert_eq!(
        next_event(&rx, wait).await,
        Some(TransportEvent::Closed { clean: false })
    );
    assert_eq!(next_event(&rx, wait).await, Some(TransportEvent::Opened));

    handle.shutdown();
    tokio::time::timeout(wait, task)
        .await
        .expect("transport task ends")
        .expect("transport task joins");
    server.await.expect("server task");
}

#[tokio::test]
async fn unreachable_backend_reports_unavailable() {
    let (listener, url) = local_server().await;
    drop(listener);

    let (tx, rx) = crossbeam_channel::unbounded();
    let (handle, task) = transport::spawn(url, fast_policy(), tx);

    assert_eq!(
        next_event(&rx, Duration::from_secs(5)).await,
        Some(TransportEvent::Unavailable)
    );

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("transport task ends")
        .expect("transport task joins");
}
