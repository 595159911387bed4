//! Stdio binding: newline-delimited JSON over stdin/stdout.
//!
//! Each inbound line is dispatched on its own task so a slow tool call
//! never blocks the read loop; responses come back through a single
//! writer task so every outbound message is one atomic line. EOF on
//! stdin destroys the sessions this stream created and shuts down
//! gracefully.

use mcpd::{Dispatcher, SessionId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WRITE_QUEUE: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sessions created over one stdio stream, destroyed when it ends.
#[derive(Default)]
pub struct StreamSessions {
    owned: Mutex<HashSet<SessionId>>,
}

impl StreamSessions {
    pub fn note(&self, result: &mcpd::DispatchResult) {
        let mut owned = self.owned.lock();
        if let Some(created) = &result.session_created {
            owned.insert(created.clone());
        }
        if let Some(destroyed) = &result.session_destroyed {
            owned.remove(destroyed);
        }
    }

    pub fn drain(&self) -> Vec<SessionId> {
        self.owned.lock().drain().collect()
    }
}

/// Dispatch one line and hand back the serialized response, if any.
pub async fn handle_line(
    dispatcher: &Dispatcher,
    sessions: &StreamSessions,
    line: &str,
) -> Option<String> {
    let result = dispatcher.handle(line, None).await;
    sessions.note(&result);
    result
        .response
        .map(|response| serde_json::to_string(&response).expect("response serializes"))
}

/// Serve the dispatcher over stdin/stdout until EOF or `shutdown`.
pub async fn serve(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            if stdout.write_all(message.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Forward server-initiated notifications onto the same writer.
    let mut notifications = dispatcher.notifications().subscribe();
    let notify_tx = tx.clone();
    let notify_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(envelope) => {
                        let Ok(line) = serde_json::to_string(&envelope) else {
                            continue;
                        };
                        if notify_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stdio notification stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = notify_shutdown.cancelled() => break,
            }
        }
    });

    let sessions = Arc::new(StreamSessions::default());
    let mut requests = JoinSet::new();

    info!("stdio transport ready, reading from stdin");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let dispatcher = Arc::clone(&dispatcher);
                    let sessions = Arc::clone(&sessions);
                    let tx = tx.clone();
                    requests.spawn(async move {
                        if let Some(response) =
                            handle_line(&dispatcher, &sessions, &line).await
                        {
                            let _ = tx.send(response).await;
                        }
                    });
                }
                Ok(None) => {
                    info!("stdin closed, shutting down stdio transport");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            },
            _ = shutdown.cancelled() => {
                info!("shutdown requested, stopping stdio transport");
                break;
            }
        }
    }

    // Let in-flight requests finish writing, then cut them off.
    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        while requests.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("in-flight requests did not drain in time, aborting");
        requests.abort_all();
    }

    // This stream owns the sessions it created.
    for session in sessions.drain() {
        debug!(session_id = %session, "destroying stream-owned session");
        dispatcher.sessions().destroy(&session).await;
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpd::{AnonymousVerifier, InMemorySessionStore, PrimitiveRegistry, ServerConfig};
    use serde_json::{Value, json};

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(PrimitiveRegistry::new()),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(AnonymousVerifier::new([])),
            ServerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn lines_round_trip_through_the_dispatcher() {
        let dispatcher = dispatcher();
        let sessions = StreamSessions::default();

        let line = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
            .to_string();
        let response = handle_line(&dispatcher, &sessions, &line).await.unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["id"], 1);
        assert!(parsed["result"]["sessionId"].is_string());
        // One line in, one line out: the response is a single JSON document.
        assert!(!response.contains('\n'));
    }

    #[tokio::test]
    async fn notifications_produce_no_output_line() {
        let dispatcher = dispatcher();
        let sessions = StreamSessions::default();
        let line = json!({"jsonrpc": "2.0", "method": "$/cancel",
                          "params": {"invocationId": "x"}})
            .to_string();
        assert!(handle_line(&dispatcher, &sessions, &line).await.is_none());
    }

    #[tokio::test]
    async fn stream_owned_sessions_are_tracked_and_destroyed_on_eof() {
        let dispatcher = dispatcher();
        let sessions = StreamSessions::default();

        let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
            .to_string();
        let response = handle_line(&dispatcher, &sessions, &init).await.unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        let session_id = parsed["result"]["sessionId"].as_str().unwrap().to_owned();

        // Explicit shutdown removes the session from stream ownership.
        let owned = sessions.drain();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].as_str(), session_id);

        // Simulate EOF cleanup.
        for session in owned {
            dispatcher.sessions().destroy(&session).await;
        }
        assert_eq!(dispatcher.sessions().count().await, 0);
    }

    #[tokio::test]
    async fn explicit_shutdown_releases_stream_ownership() {
        let dispatcher = dispatcher();
        let sessions = StreamSessions::default();

        let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
            .to_string();
        let response = handle_line(&dispatcher, &sessions, &init).await.unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        let session_id = parsed["result"]["sessionId"].as_str().unwrap();

        let bye = json!({"jsonrpc": "2.0", "id": 2, "method": "shutdown",
                         "params": {"sessionId": session_id}})
            .to_string();
        handle_line(&dispatcher, &sessions, &bye).await.unwrap();

        assert!(sessions.drain().is_empty());
    }
}
