use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use kubemux_types::{LogTarget, SessionEvent, StreamOptions};

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::events::EventHub;
use crate::feed::RenderFeed;
use crate::sandbox::FilterSandbox;

struct ActiveSession {
    connection_id: String,
    cancel: CancellationToken,
    streaming: Arc<AtomicBool>,
    generation: u64,
}

/// Opens, monitors, and tears down one remote log stream per session.
///
/// Each received line fans out to the render feed and, when a filter
/// process is live for the session, to the sandbox stdin. Per-session
/// state machine: idle, streaming, stopped; at most one remote stream per
/// session id.
pub struct LogSessionManager {
    sessions: Arc<Mutex<HashMap<String, ActiveSession>>>,
    connections: Arc<ConnectionManager>,
    feed: Arc<RenderFeed>,
    sandbox: Arc<FilterSandbox>,
    events: Arc<EventHub<SessionEvent>>,
    next_generation: AtomicU64,
}

impl LogSessionManager {
    pub fn new(
        connections: Arc<ConnectionManager>,
        feed: Arc<RenderFeed>,
        sandbox: Arc<FilterSandbox>,
        events: Arc<EventHub<SessionEvent>>,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connections,
            feed,
            sandbox,
            events,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Open the remote log stream for a session.
    ///
    /// A session id that already has a live stream is replaced: the old
    /// stream is cancelled when the new one registers, so no duplicate
    /// remote streams exist for one session even under concurrent starts.
    /// Stream-open and transport errors after registration surface as
    /// session-scoped error events, never as failures of other sessions.
    pub fn start(
        &self,
        session_id: &str,
        connection_id: &str,
        target: LogTarget,
        options: StreamOptions,
    ) -> Result<()> {
        let client = self.connections.client(connection_id)?;

        let cancel = CancellationToken::new();
        let streaming = Arc::new(AtomicBool::new(true));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        self.register(
            session_id,
            ActiveSession {
                connection_id: connection_id.to_string(),
                cancel: cancel.clone(),
                streaming: Arc::clone(&streaming),
                generation,
            },
        );

        self.spawn_stream(
            session_id.to_string(),
            client,
            target,
            options,
            cancel,
            streaming,
            generation,
        );

        tracing::debug!(session = session_id, connection = connection_id, "session started");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_stream(
        &self,
        session_id: String,
        client: kube::Client,
        target: LogTarget,
        options: StreamOptions,
        cancel: CancellationToken,
        streaming: Arc<AtomicBool>,
        generation: u64,
    ) {
        let events = Arc::clone(&self.events);
        let feed = Arc::clone(&self.feed);
        let sandbox = Arc::clone(&self.sandbox);
        let deregister = self.deregister_handle();

        tokio::spawn(async move {
            let api: Api<Pod> = Api::namespaced(client, &target.namespace);
            let params = LogParams {
                follow: options.follow,
                container: Some(target.container.clone()),
                // Server-side time filter takes precedence over the line cap
                tail_lines: if options.since_time.is_some() {
                    None
                } else {
                    options.tail_lines
                },
                since_time: options.since_time,
                ..Default::default()
            };

            let stream = match api.log_stream(&target.pod, &params).await {
                Ok(stream) => stream,
                Err(e) => {
                    streaming.store(false, Ordering::SeqCst);
                    deregister(&session_id, generation);
                    events.emit(
                        &session_id,
                        SessionEvent::Error {
                            session_id: session_id.clone(),
                            message: format!("failed to open log stream for {}: {}", target, e),
                        },
                    );
                    return;
                }
            };

            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    result = lines.try_next() => {
                        match result {
                            Ok(Some(line)) => {
                                events.emit(
                                    &session_id,
                                    SessionEvent::Data {
                                        session_id: session_id.clone(),
                                        line: line.clone(),
                                    },
                                );
                                feed.push(&session_id, &line);
                                if sandbox.is_active(&session_id) {
                                    sandbox.write(&session_id, &format!("{}\n", line)).await;
                                }
                            }
                            Ok(None) => {
                                // Stream ended: pod gone or one-shot fetch done
                                events.emit(
                                    &session_id,
                                    SessionEvent::Closed {
                                        session_id: session_id.clone(),
                                    },
                                );
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(session = %session_id, "log stream error: {}", e);
                                events.emit(
                                    &session_id,
                                    SessionEvent::Error {
                                        session_id: session_id.clone(),
                                        message: e.to_string(),
                                    },
                                );
                                break;
                            }
                        }
                    }
                }
            }

            streaming.store(false, Ordering::SeqCst);
            deregister(&session_id, generation);
        });
    }

    /// Insert a session, cancelling any entry it displaces.
    ///
    /// The single insert makes replacement atomic: whichever of two racing
    /// starts registers last wins, and the loser's stream is cancelled
    /// rather than silently dropped with a live token.
    fn register(&self, session_id: &str, session: ActiveSession) {
        let displaced = self.sessions.lock().insert(session_id.to_string(), session);
        if let Some(prev) = displaced {
            prev.streaming.store(false, Ordering::SeqCst);
            prev.cancel.cancel();
        }
    }

    /// Abort the session's stream and remove its registration.
    ///
    /// Unknown session ids are a no-op; stopping twice is safe.
    pub fn stop(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().remove(session_id) {
            session.streaming.store(false, Ordering::SeqCst);
            session.cancel.cancel();
            tracing::debug!(session = session_id, "session stopped");
        }
    }

    /// Stop every registered session (bulk teardown)
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        for (id, session) in drained {
            session.streaming.store(false, Ordering::SeqCst);
            session.cancel.cancel();
            tracing::debug!(session = %id, "session stopped");
        }
    }

    /// Stop the sessions belonging to a connection being removed
    pub fn stop_for_connection(&self, connection_id: &str) -> Vec<String> {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.connection_id == connection_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &ids {
            self.stop(id);
        }
        ids
    }

    /// Whether the session currently has a live remote stream
    pub fn is_streaming(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock();
        sessions
            .get(session_id)
            .map(|s| s.streaming.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Session ids with a live registration
    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Closure for stream tasks to drop their own registration when the
    /// remote stream ends, without racing a newer stream for the same id.
    fn deregister_handle(&self) -> impl Fn(&str, u64) + Send + 'static {
        let sessions = Arc::clone(&self.sessions);
        move |session_id: &str, generation: u64| {
            let mut map = sessions.lock();
            if map
                .get(session_id)
                .is_some_and(|s| s.generation == generation)
            {
                map.remove(session_id);
            }
        }
    }
}
