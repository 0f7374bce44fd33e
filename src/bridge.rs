//! Byte pump between one WebSocket and one machine console.
//!
//! Output travels on a spawned task, input on the caller's task. Whichever
//! side finishes first cancels the other through a token derived from the
//! console's own closed token, so a console that goes away ends the bridge
//! even while the client is idle.

use crate::machine::Console;
use crate::models::MachineId;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Why a bridge ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The client closed the socket, or the connection failed.
    ClientDisconnected,
    /// The machine's console stream ended; the client was sent a normal close.
    ConsoleClosed,
    /// The client fell behind the console output buffer and was sent a
    /// "try again" close instead of a stream with gaps in it.
    ClientLagged,
}

/// Forwards console output to `sink` as binary frames and client text or
/// binary frames to the console, until either side goes away.
///
/// `on_activity` runs once per client message of any kind, including
/// message types that are otherwise dropped.
pub async fn run_bridge<S, R, E>(
    session: &str,
    machine: MachineId,
    console: Console,
    mut sink: S,
    mut stream: R,
    on_activity: impl Fn() + Send,
) -> BridgeOutcome
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let Console {
        mut output,
        input,
        closed,
    } = console;
    let stop = closed.child_token();

    info!(%session, %machine, "console bridge attached");

    let outbound_stop = stop.clone();
    let console_closed = closed.clone();
    let send_session = session.to_string();
    let mut send_task = tokio::spawn(async move {
        let mut total_bytes = 0usize;
        let mut overran = false;
        loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Ok(data) => {
                        total_bytes += data.len();
                        if let Err(error) = sink.send(Message::Binary(data.into())).await {
                            debug!(session = %send_session, %machine, "failed to send console output: {error}");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session = %send_session, %machine, skipped, "client too slow, closing bridge");
                        overran = true;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = outbound_stop.cancelled() => break,
            }
        }

        let frame = if overran {
            Some(CloseFrame {
                code: close_code::AGAIN,
                reason: Utf8Bytes::from_static("console output overrun"),
            })
        } else if console_closed.is_cancelled() {
            Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static(""),
            })
        } else {
            None
        };
        if let Some(frame) = frame {
            let _ = sink.send(Message::Close(Some(frame))).await;
        }
        let _ = sink.close().await;
        outbound_stop.cancel();
        debug!(session = %send_session, %machine, total_bytes, "output forwarder finished");
        overran
    });

    let mut input_bytes = 0usize;
    // `None` means the forwarder side ended first
    let client_side = loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break None,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                debug!(%session, %machine, "websocket receive error: {error}");
                break Some(BridgeOutcome::ClientDisconnected);
            }
            None => break Some(BridgeOutcome::ClientDisconnected),
        };

        on_activity();
        let data = match message {
            Message::Text(text) => text.as_str().as_bytes().to_vec(),
            Message::Binary(data) => data.to_vec(),
            Message::Close(_) => break Some(BridgeOutcome::ClientDisconnected),
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        input_bytes += data.len();
        if input.send(data).await.is_err() {
            break Some(BridgeOutcome::ConsoleClosed);
        }
    };

    stop.cancel();
    let outcome = match client_side {
        Some(BridgeOutcome::ClientDisconnected) => {
            send_task.abort();
            BridgeOutcome::ClientDisconnected
        }
        // Let the forwarder drain remaining output and deliver its close frame
        _ => match (&mut send_task).await {
            Ok(true) => BridgeOutcome::ClientLagged,
            _ if closed.is_cancelled() || client_side.is_some() => BridgeOutcome::ConsoleClosed,
            _ => BridgeOutcome::ClientDisconnected,
        },
    };

    info!(%session, %machine, ?outcome, input_bytes, "console bridge detached");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        output_tx: broadcast::Sender<Vec<u8>>,
        input_rx: mpsc::Receiver<Vec<u8>>,
        closed: CancellationToken,
        client_tx: UnboundedSender<Result<Message, Infallible>>,
        client_rx: UnboundedReceiver<Message>,
        touches: Arc<AtomicUsize>,
        bridge: tokio::task::JoinHandle<BridgeOutcome>,
    }

    fn start() -> Harness {
        start_with_capacity(64)
    }

    fn start_with_capacity(capacity: usize) -> Harness {
        let (output_tx, output_rx) = broadcast::channel(capacity);
        let (input_tx, input_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();
        let console = Console::new(output_rx, input_tx, closed.clone());

        let (sink, client_rx) = unbounded::<Message>();
        let (client_tx, stream) = unbounded::<Result<Message, Infallible>>();
        let touches = Arc::new(AtomicUsize::new(0));
        let counter = touches.clone();

        let bridge = tokio::spawn(async move {
            run_bridge("a1b2c3", MachineId::One, console, sink, stream, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
        });

        Harness {
            output_tx,
            input_rx,
            closed,
            client_tx,
            client_rx,
            touches,
            bridge,
        }
    }

    async fn next_client_message(rx: &mut UnboundedReceiver<Message>) -> Option<Message> {
        timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for client message")
    }

    #[tokio::test]
    async fn forwards_text_and_binary_input_in_order() {
        let mut h = start();

        h.client_tx
            .unbounded_send(Ok(Message::Text("ls".into())))
            .unwrap();
        h.client_tx
            .unbounded_send(Ok(Message::Binary(vec![b'\r'].into())))
            .unwrap();

        assert_eq!(h.input_rx.recv().await.unwrap(), b"ls".to_vec());
        assert_eq!(h.input_rx.recv().await.unwrap(), b"\r".to_vec());
        assert_eq!(h.touches.load(Ordering::SeqCst), 2);

        drop(h.client_tx);
        assert_eq!(h.bridge.await.unwrap(), BridgeOutcome::ClientDisconnected);
    }

    #[tokio::test]
    async fn console_output_arrives_as_binary_frames() {
        let mut h = start();
        // Wait until the forwarder is subscribed and polling
        tokio::task::yield_now().await;

        h.output_tx.send(b"login: ".to_vec()).unwrap();
        h.output_tx.send(b"root".to_vec()).unwrap();

        let mut received = Vec::new();
        while received.len() < b"login: root".len() {
            match next_client_message(&mut h.client_rx).await {
                Some(Message::Binary(data)) => received.extend_from_slice(&data),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(received, b"login: root");

        drop(h.client_tx);
        h.bridge.await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_dropped_but_still_counts_as_activity() {
        let mut h = start();

        h.client_tx
            .unbounded_send(Ok(Message::Ping(vec![1].into())))
            .unwrap();
        h.client_tx
            .unbounded_send(Ok(Message::Text("x".into())))
            .unwrap();

        assert_eq!(h.input_rx.recv().await.unwrap(), b"x".to_vec());
        assert_eq!(h.touches.load(Ordering::SeqCst), 2);

        drop(h.client_tx);
        h.bridge.await.unwrap();
    }

    #[tokio::test]
    async fn console_close_sends_normal_close_frame() {
        let mut h = start();
        tokio::task::yield_now().await;

        h.output_tx.send(b"bye".to_vec()).unwrap();
        h.closed.cancel();

        let outcome = timeout(Duration::from_secs(5), &mut h.bridge)
            .await
            .expect("bridge did not stop")
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::ConsoleClosed);

        let mut frames = Vec::new();
        while let Some(message) = next_client_message(&mut h.client_rx).await {
            frames.push(message);
        }
        assert!(matches!(&frames[0], Message::Binary(data) if &data[..] == b"bye"));
        match frames.last() {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_close_detaches_without_closing_console() {
        let h = start();

        h.client_tx
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();

        let outcome = timeout(Duration::from_secs(5), h.bridge)
            .await
            .expect("bridge did not stop")
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::ClientDisconnected);
        assert!(!h.closed.is_cancelled());
    }

    #[tokio::test]
    async fn falling_behind_output_closes_with_try_again() {
        let mut h = start_with_capacity(4);
        // The bridge task has not run yet, so its receiver overruns
        for n in 0..10u8 {
            h.output_tx.send(vec![n]).unwrap();
        }

        let outcome = timeout(Duration::from_secs(5), &mut h.bridge)
            .await
            .expect("bridge did not stop")
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::ClientLagged);
        assert!(!h.closed.is_cancelled());

        match next_client_message(&mut h.client_rx).await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, close_code::AGAIN);
                assert_eq!(frame.reason.as_str(), "console output overrun");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(next_client_message(&mut h.client_rx).await.is_none());
    }
}
