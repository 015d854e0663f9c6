//! Live `Stats` stream for one token.
//!
//! Each connection is split in two tasks. The writer owns the socket's send
//! half and drains an mpsc queue fed by the hub, pinging at half the
//! keepalive. The read loop owns the receive half, resets the keepalive
//! deadline on every pong and reports the connection dead when the deadline
//! passes or the socket goes away. Teardown is left to the hub's reaper.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use market_data::{ConnectionId, SinkError, StatsSink, SubscriberHub};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use types::bucket::Stats;

use crate::error::AppError;
use crate::models::TokenQuery;
use crate::state::AppState;

/// Messages queued per connection before pushes start failing.
const OUTBOUND_BUFFER: usize = 64;

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    let token = query.require_token()?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, token)))
}

/// Hub-facing half of a WebSocket connection.
struct WsSink {
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl StatsSink for WsSink {
    fn push(&self, stats: &Stats) -> Result<(), SinkError> {
        let text = serde_json::to_string(stats).map_err(|e| SinkError::Encode(e.to_string()))?;
        self.outbound
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SinkError::Full,
                mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
            })
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (sender, receiver) = socket.split();
    let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let closed = CancellationToken::new();

    tokio::spawn(write_loop(
        sender,
        rx,
        closed.clone(),
        state.ws_keepalive / 2,
    ));

    let sink = Arc::new(WsSink {
        outbound,
        closed: closed.clone(),
    });
    let engine = &state.engine;
    let id = match state
        .hub
        .subscribe(&token, sink, || engine.stats(&token, Utc::now()))
    {
        Ok(id) => id,
        Err(e) => {
            debug!(token = %token, error = %e, "Subscription failed");
            return;
        }
    };

    let end = watch_connection(receiver, state.ws_keepalive, closed, &state.hub, id).await;
    debug!(connection = id, token = %token, end = ?end, "Connection ended");
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
    ping_every: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            next = rx.recv() => {
                let Some(msg) = next else { break };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
}

/// Why a read loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    /// The hub's reaper closed the connection.
    Cancelled,
    KeepaliveExpired,
    /// Close frame or end of stream.
    PeerClosed,
    Failed,
}

/// Run the read loop, then hand the connection to the reaper.
async fn watch_connection<S>(
    receiver: S,
    keepalive: Duration,
    closed: CancellationToken,
    hub: &SubscriberHub,
    id: ConnectionId,
) -> ReadEnd
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let end = read_loop(receiver, keepalive, closed).await;
    hub.mark_dead(id);
    end
}

async fn read_loop<S>(mut receiver: S, keepalive: Duration, closed: CancellationToken) -> ReadEnd
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(keepalive);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = closed.cancelled() => return ReadEnd::Cancelled,
            _ = &mut deadline => return ReadEnd::KeepaliveExpired,
            next = receiver.next() => match next {
                Some(Ok(Message::Pong(_))) => {
                    deadline.as_mut().reset(Instant::now() + keepalive);
                }
                Some(Ok(Message::Close(_))) | None => return ReadEnd::PeerClosed,
                // Clients have nothing to say on this stream.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Read failed");
                    return ReadEnd::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

    const KEEPALIVE: Duration = Duration::from_secs(60);

    type Frame = Result<Message, axum::Error>;

    fn frames() -> (UnboundedSender<Frame>, UnboundedReceiver<Frame>) {
        unbounded()
    }

    fn pong() -> Frame {
        Ok(Message::Pong(Bytes::new()))
    }

    #[tokio::test]
    async fn test_sink_queues_json_and_reports_full() {
        let (outbound, mut rx) = mpsc::channel(1);
        let sink = WsSink {
            outbound,
            closed: CancellationToken::new(),
        };
        let stats = Stats::empty("BTC", 1_708_123_456);

        sink.push(&stats).unwrap();
        assert_eq!(sink.push(&stats), Err(SinkError::Full));

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let decoded: Stats = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(decoded, stats);

        drop(rx);
        assert_eq!(sink.push(&stats), Err(SinkError::Closed));
    }

    #[test]
    fn test_close_cancels_writer() {
        let (outbound, _rx) = mpsc::channel(1);
        let closed = CancellationToken::new();
        let sink = WsSink {
            outbound,
            closed: closed.clone(),
        };
        sink.close();
        assert!(closed.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_extend_keepalive() {
        let (tx, rx) = frames();
        let start = Instant::now();
        let reader = tokio::spawn(read_loop(rx, KEEPALIVE, CancellationToken::new()));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(40)).await;
            tx.unbounded_send(pong()).unwrap();
        }
        tokio::task::yield_now().await;
        // Two keepalives in, still alive.
        assert!(!reader.is_finished());

        assert_eq!(reader.await.unwrap(), ReadEnd::KeepaliveExpired);
        assert!(start.elapsed() >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_expires_after_keepalive() {
        let (_tx, rx) = frames();
        let reader = tokio::spawn(read_loop(rx, KEEPALIVE, CancellationToken::new()));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!reader.is_finished());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(reader.is_finished());
        assert_eq!(reader.await.unwrap(), ReadEnd::KeepaliveExpired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_frames_do_not_extend_keepalive() {
        let (tx, rx) = frames();
        let start = Instant::now();
        let reader = tokio::spawn(read_loop(rx, KEEPALIVE, CancellationToken::new()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        tx.unbounded_send(Ok(Message::Text("hello".into()))).unwrap();

        assert_eq!(reader.await.unwrap(), ReadEnd::KeepaliveExpired);
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_read_loop() {
        let (_tx, rx) = frames();
        let closed = CancellationToken::new();
        let start = Instant::now();
        let reader = tokio::spawn(read_loop(rx, KEEPALIVE, closed.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        closed.cancel();

        assert_eq!(reader.await.unwrap(), ReadEnd::Cancelled);
        assert!(start.elapsed() < KEEPALIVE);
    }

    #[tokio::test]
    async fn test_peer_close_ends_read_loop() {
        let (tx, rx) = frames();
        tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(
            read_loop(rx, KEEPALIVE, CancellationToken::new()).await,
            ReadEnd::PeerClosed
        );

        let (tx, rx) = frames();
        drop(tx);
        assert_eq!(
            read_loop(rx, KEEPALIVE, CancellationToken::new()).await,
            ReadEnd::PeerClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_reaped_and_closed() {
        let (hub, mut reaper) = SubscriberHub::new(8);
        let (outbound, mut queued) = mpsc::channel(4);
        let closed = CancellationToken::new();
        let sink = Arc::new(WsSink {
            outbound,
            closed: closed.clone(),
        });
        let id = hub
            .subscribe("BTC", sink, || Stats::empty("BTC", 1_708_123_456))
            .unwrap();
        assert!(matches!(queued.recv().await, Some(Message::Text(_))));

        let (_tx, rx) = frames();
        let end = watch_connection(rx, KEEPALIVE, closed.clone(), &hub, id).await;
        assert_eq!(end, ReadEnd::KeepaliveExpired);
        // Reported, not yet torn down.
        assert_eq!(hub.subscriber_count("BTC"), 1);
        assert!(!closed.is_cancelled());

        assert_eq!(reaper.reap_next().await, Some((id, true)));
        assert!(closed.is_cancelled());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaped_connection_stops_reading() {
        let (hub, mut reaper) = SubscriberHub::new(8);
        let (outbound, _queued) = mpsc::channel(4);
        let closed = CancellationToken::new();
        let sink = Arc::new(WsSink {
            outbound,
            closed: closed.clone(),
        });
        let id = hub
            .subscribe("ETH", sink, || Stats::empty("ETH", 1_708_123_456))
            .unwrap();

        let (_tx, rx) = frames();
        let watcher = {
            let hub = hub.clone();
            let closed = closed.clone();
            tokio::spawn(async move { watch_connection(rx, KEEPALIVE, closed, &hub, id).await })
        };

        // A failed broadcast reports the connection before the read loop does.
        hub.mark_dead(id);
        assert_eq!(reaper.reap_next().await, Some((id, true)));

        assert_eq!(watcher.await.unwrap(), ReadEnd::Cancelled);
        assert_eq!(reaper.reap_next().await, Some((id, false)));
    }
}
