use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};

use crate::db::models::UserId;
use crate::hub::{Connection, Hub, Outbound};
use crate::state::AppState;
use crate::ws::protocol::Event;

type WsSink = SplitSink<WebSocket, Message>;

/// Keepalive pings go out a little before the peer's liveness window runs out.
fn keepalive_interval(liveness: Duration) -> Duration {
    (liveness * 9 / 10).max(Duration::from_millis(10))
}

/// Run the two pumps for an authenticated WebSocket.
///
/// - Write pump (spawned): owns the sink, drains the connection's outbound
///   queue and sends keepalive pings.
/// - Read pump (this task): enforces the liveness window and hands each text
///   frame to the event router on the blocking pool.
///
/// Whichever side stops first tears the connection down through the hub,
/// which signals the other side to stop too.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (sink, mut stream) = socket.split();
    let liveness = state.hub_config.liveness_window();
    let write_wait = state.hub_config.write_wait();

    let (conn, outbound) = Connection::new(user_id, state.hub_config.outbound_capacity);
    let mut shutdown = conn.shutdown_signal();
    state.hub.register(Arc::clone(&conn));

    tracing::info!(user_id, connection = conn.id(), "WebSocket actor started");

    let mut writer = tokio::spawn(write_pump(
        sink,
        outbound,
        Arc::clone(&state.hub),
        Arc::clone(&conn),
        WriteTiming {
            keepalive: keepalive_interval(liveness),
            write_wait,
        },
    ));

    loop {
        let next = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => {
                tracing::debug!(user_id, "Connection closed by hub");
                break;
            }
            next = timeout(liveness, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::info!(user_id, "No frames within liveness window, closing");
                break;
            }
            Ok(None) => {
                tracing::info!(user_id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => {
                    let router = Arc::clone(&state.router);
                    let dispatched =
                        tokio::task::spawn_blocking(move || router.dispatch(user_id, text.as_str()))
                            .await;
                    match dispatched {
                        Ok(routed) => tracing::trace!(user_id, ?routed, "Frame routed"),
                        Err(e) => tracing::error!(user_id, error = %e, "Event handler panicked"),
                    }
                }
                Message::Binary(data) => {
                    tracing::debug!(user_id, len = data.len(), "Ignoring binary frame");
                }
                // Pings are answered by the socket layer; both just count as liveness
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::info!(user_id, reason = ?frame, "Client initiated close");
                    break;
                }
            },
        }
    }

    state.hub.teardown(&conn);
    // A writer stuck on a peer that stopped reading is cut loose so both
    // socket halves drop and the TCP connection closes
    match timeout(write_wait, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(user_id, error = %e, "Write pump did not shut down cleanly"),
        Err(_) => {
            tracing::warn!(user_id, "Write pump stalled after teardown, aborting");
            writer.abort();
        }
    }

    tracing::info!(user_id, connection = conn.id(), "WebSocket actor stopped");
}

#[derive(Debug, Clone, Copy)]
struct WriteTiming {
    keepalive: Duration,
    /// Upper bound on any single write or flush.
    write_wait: Duration,
}

/// Write pump: forwards queued events to the sink, coalescing bursts into a
/// single flush, and pings on the keepalive interval. Every write is bounded
/// by `write_wait`; a peer that stops reading is torn down.
async fn write_pump(
    mut sink: WsSink,
    mut outbound: Outbound,
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    timing: WriteTiming,
) {
    let mut ticker = interval(timing.keepalive);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let batch = write_batch(&mut sink, event, &mut outbound);
                let written = timeout(timing.write_wait, batch).await;
                if let Err(reason) = write_outcome(written) {
                    tracing::warn!(user_id = conn.user_id(), %reason, "WebSocket send failed");
                    hub.teardown(&conn);
                    return;
                }
            }
            _ = ticker.tick() => {
                let ping = sink.send(Message::Ping(Vec::new().into()));
                let pinged = timeout(timing.write_wait, ping).await;
                if let Err(reason) = write_outcome(pinged) {
                    tracing::warn!(user_id = conn.user_id(), %reason, "Keepalive ping failed");
                    hub.teardown(&conn);
                    return;
                }
            }
        }
    }

    let close_frame = CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    };
    let _ = timeout(timing.write_wait, async {
        let _ = sink.send(Message::Close(Some(close_frame))).await;
        let _ = sink.close().await;
    })
    .await;
}

fn write_outcome<T>(
    result: Result<Result<T, axum::Error>, tokio::time::error::Elapsed>,
) -> Result<(), String> {
    match result {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

/// Feed `first` plus everything else already queued, then flush once.
async fn write_batch(
    sink: &mut WsSink,
    first: Event,
    outbound: &mut Outbound,
) -> Result<usize, axum::Error> {
    feed_event(sink, &first).await?;
    let mut written = 1;
    while let Some(event) = outbound.try_recv() {
        feed_event(sink, &event).await?;
        written += 1;
    }
    sink.flush().await?;
    Ok(written)
}

async fn feed_event(sink: &mut WsSink, event: &Event) -> Result<(), axum::Error> {
    match event.to_json() {
        Ok(json) => sink.feed(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(kind = %event.kind, error = %e, "Failed to encode outbound event");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_fires_inside_liveness_window() {
        assert_eq!(keepalive_interval(Duration::from_secs(60)), Duration::from_secs(54));
        assert_eq!(keepalive_interval(Duration::ZERO), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_write_outcome_reports_elapsed_deadline() {
        let stalled = timeout(
            Duration::from_millis(50),
            std::future::pending::<Result<(), axum::Error>>(),
        )
        .await;
        assert_eq!(write_outcome(stalled), Err("write deadline exceeded".to_string()));

        let done = timeout(Duration::from_millis(50), async { Ok::<usize, axum::Error>(3) }).await;
        assert_eq!(write_outcome(done), Ok(()));
    }
}
