// WebSocket server: accepts club devices and bridges them to the event loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitStream, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

/// Events emitted by the WebSocket server to the application layer.
#[derive(Debug)]
pub enum WsEvent {
    /// A new client finished the handshake. `outbound` is the channel the
    /// dispatcher writes this connection's frames into.
    Connected {
        conn_id: u64,
        addr: String,
        outbound: mpsc::Sender<String>,
    },
    /// A text message arrived from a client (raw JSON string).
    Message { conn_id: u64, text: String },
    /// The client's socket closed, for any reason.
    Disconnected { conn_id: u64 },
}

/// Capacity of each connection's outbound frame queue. A client that stops
/// reading long enough to fill it starts losing notifications, not blocking
/// the event loop.
const OUTBOUND_QUEUE: usize = 64;

/// Run the WebSocket server on the given port, forwarding events through `tx`.
///
/// Binds on all interfaces so phones on the club network can reach it, and
/// serves any number of concurrent connections, each handled by its own task.
/// Connection ids are process-unique and never reused.
pub async fn run(port: u16, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    let next_id = Arc::new(AtomicU64::new(1));
    loop {
        let (stream, addr) = listener.accept().await?;
        let addr_str = addr.to_string();

        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {addr_str}: {e}");
                continue;
            }
        };

        let conn_id = next_id.fetch_add(1, Ordering::Relaxed);
        info!("Connection {conn_id} accepted from {addr_str}");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        if tx
            .send(WsEvent::Connected {
                conn_id,
                addr: addr_str.clone(),
                outbound: out_tx,
            })
            .await
            .is_err()
        {
            // Application side is gone; stop accepting.
            break;
        }

        tokio::spawn(handle_connection(
            ws_stream,
            conn_id,
            addr_str,
            tx.clone(),
            out_rx,
        ));
    }

    Ok(())
}

/// Drive one connection to completion: pump outbound frames in a side task,
/// read inbound frames until the socket drops, then report the disconnect.
async fn handle_connection<S>(
    ws_stream: WebSocketStream<S>,
    conn_id: u64,
    addr: String,
    tx: mpsc::Sender<WsEvent>,
    mut outbound: mpsc::Receiver<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, read) = ws_stream.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = process_messages(read, &tx, conn_id, &addr).await;
    writer.abort();

    info!("Connection {conn_id} ({addr}) closed");
    let _ = tx.send(WsEvent::Disconnected { conn_id }).await;
}

/// Forward text frames from a connection's read half through `tx`. Returns
/// `Err(())` when the application channel is closed, signalling shutdown.
pub async fn process_messages<S>(
    read: SplitStream<WebSocketStream<S>>,
    tx: &mpsc::Sender<WsEvent>,
    conn_id: u64,
    addr: &str,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    process_message_stream(read, tx, conn_id, addr).await
}

/// Process raw WebSocket [`Message`] items from any [`Stream`], forwarding
/// text payloads through `tx`. This is a pure-logic function that requires
/// no I/O and is the primary unit-test target.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<WsEvent>,
    conn_id: u64,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let event = WsEvent::Message {
                    conn_id,
                    text: text.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Connection {conn_id} ({addr}) sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error on connection {conn_id} ({addr}): {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    fn expect_message(event: WsEvent) -> (u64, String) {
        match event {
            WsEvent::Message { conn_id, text } => (conn_id, text),
            other => panic!("expected message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_message_forwarded_with_connection_id() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![Ok(Message::Text("hello".into()))];

        process_message_stream(mock_stream(messages), &tx, 7, "test")
            .await
            .unwrap();

        let (conn_id, text) = expect_message(rx.recv().await.unwrap());
        assert_eq!(conn_id, 7);
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn multiple_messages_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("first".into())),
            Ok(Message::Text("second".into())),
            Ok(Message::Text("third".into())),
        ];

        process_message_stream(mock_stream(messages), &tx, 1, "test")
            .await
            .unwrap();

        assert_eq!(expect_message(rx.recv().await.unwrap()).1, "first");
        assert_eq!(expect_message(rx.recv().await.unwrap()).1, "second");
        assert_eq!(expect_message(rx.recv().await.unwrap()).1, "third");
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("before_close".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after_close_should_not_appear".into())),
        ];

        process_message_stream(mock_stream(messages), &tx, 1, "test")
            .await
            .unwrap();

        assert_eq!(expect_message(rx.recv().await.unwrap()).1, "before_close");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_stops_processing() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("before_error".into())),
            Err(WsError::ConnectionClosed),
            Ok(Message::Text("after_error_should_not_appear".into())),
        ];

        process_message_stream(mock_stream(messages), &tx, 1, "test")
            .await
            .unwrap();

        assert_eq!(expect_message(rx.recv().await.unwrap()).1, "before_error");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_and_ping_messages_are_ignored() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Pong(vec![].into())),
            Ok(Message::Text("after_ignored".into())),
        ];

        process_message_stream(mock_stream(messages), &tx, 1, "test")
            .await
            .unwrap();

        assert_eq!(expect_message(rx.recv().await.unwrap()).1, "after_ignored");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn returns_err_when_channel_closed() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);

        let messages = vec![Ok(Message::Text("orphan".into()))];
        let result = process_message_stream(mock_stream(messages), &tx, 1, "test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_stream_completes_normally() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages: Vec<Result<Message, WsError>> = vec![];

        process_message_stream(mock_stream(messages), &tx, 1, "test")
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn json_payload_preserved_exactly() {
        let (tx, mut rx) = mpsc::channel(64);
        let payload = r#"{"type":"place_bid","round":"M1","slot":"M1_RED","amount":100}"#;
        let messages = vec![Ok(Message::Text(payload.into()))];

        process_message_stream(mock_stream(messages), &tx, 3, "test")
            .await
            .unwrap();

        assert_eq!(expect_message(rx.recv().await.unwrap()).1, payload);
    }
}
