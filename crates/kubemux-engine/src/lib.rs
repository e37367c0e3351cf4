//! Log stream multiplexing and filtering engine for kubemux
//!
//! This crate owns the concurrent parts of the system: SSH tunnel
//! lifecycle, per-session log stream acquisition and teardown, the
//! sandboxed external filter pipeline, the in-process pattern pipeline,
//! and the bounded, batch-flushed render feed.

mod classify;
mod connection;
mod error;
mod events;
mod feed;
pub mod pattern;
mod sandbox;
mod session;
mod tunnel;

use std::sync::Arc;
use std::time::Duration;

pub use classify::classify;
pub use connection::{ConnectionManager, ConnectionStore};
pub use error::{EngineError, Result};
pub use events::EventHub;
pub use feed::{
    DEFAULT_BOTTOM_TOLERANCE, DEFAULT_FLUSH_INTERVAL, FeedSnapshot, RING_CAPACITY, RenderFeed,
};
pub use sandbox::{FilterSandbox, validate_command};
pub use session::LogSessionManager;
pub use tunnel::TunnelManager;

// Re-export types used in our public API
pub use kubemux_types::{
    Connection, FilterEvent, LineSegment, LogTarget, ParsedLogLine, SessionEvent, SshEndpoint,
    StreamOptions,
};

use tokio::sync::mpsc;

/// Tunables for the engine, all with production defaults
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Ring buffer bound per session
    pub buffer_capacity: usize,
    /// Frame interval for coalesced feed flushes
    pub flush_interval: Duration,
    /// Rows from the bottom that still count as "at bottom"
    pub bottom_tolerance: usize,
    /// ssh executable used for tunnels and handshake probes
    pub ssh_binary: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: RING_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            bottom_tolerance: DEFAULT_BOTTOM_TOLERANCE,
            ssh_binary: "ssh".to_string(),
        }
    }
}

/// Facade composing the managers into the surface the UI consumes.
///
/// All failures stay scoped to their session or connection id; nothing
/// here aborts sibling sessions or the process.
pub struct LogEngine {
    tunnels: Arc<TunnelManager>,
    connections: Arc<ConnectionManager>,
    feed: Arc<RenderFeed>,
    sandbox: Arc<FilterSandbox>,
    sessions: Arc<LogSessionManager>,
    session_events: Arc<EventHub<SessionEvent>>,
    filter_events: Arc<EventHub<FilterEvent>>,
    /// Sandbox output lands here first and is pumped into the feed
    sandbox_events: Arc<EventHub<FilterEvent>>,
}

impl LogEngine {
    pub fn new(config: EngineConfig) -> Self {
        let tunnels = Arc::new(TunnelManager::new(config.ssh_binary.clone()));
        let connections = Arc::new(ConnectionManager::new(Arc::clone(&tunnels)));
        let feed = Arc::new(RenderFeed::new(
            config.buffer_capacity,
            config.flush_interval,
            config.bottom_tolerance,
        ));
        let session_events = Arc::new(EventHub::new());
        let filter_events = Arc::new(EventHub::new());
        let sandbox_events = Arc::new(EventHub::new());
        let sandbox = Arc::new(FilterSandbox::new(Arc::clone(&sandbox_events)));
        let sessions = Arc::new(LogSessionManager::new(
            Arc::clone(&connections),
            Arc::clone(&feed),
            Arc::clone(&sandbox),
            Arc::clone(&session_events),
        ));

        Self {
            tunnels,
            connections,
            feed,
            sandbox,
            sessions,
            session_events,
            filter_events,
            sandbox_events,
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a connection; SSH-backed ones get their tunnel first
    pub async fn add_connection(&self, connection: Connection) -> Result<()> {
        self.connections.add(connection).await
    }

    /// Remove a connection, stopping its sessions and closing its tunnel
    pub fn remove_connection(&self, connection_id: &str) {
        for session_id in self.sessions.stop_for_connection(connection_id) {
            self.teardown_filter(&session_id);
        }
        self.connections.remove(connection_id);
    }

    /// Handshake-only SSH probe with a bounded timeout
    pub async fn test_ssh(&self, ssh: &SshEndpoint) -> bool {
        self.connections.test_ssh(ssh).await
    }

    /// Cluster accessors (namespaces, pods, containers) for a connection
    pub fn cluster(&self, connection_id: &str) -> Result<Arc<kubemux_k8s::ClusterClient>> {
        self.connections.cluster(connection_id)
    }

    // ------------------------------------------------------------------
    // Log sessions
    // ------------------------------------------------------------------

    /// Open a remote log stream for a session id
    pub fn start_log_stream(
        &self,
        session_id: &str,
        connection_id: &str,
        target: LogTarget,
        options: StreamOptions,
    ) -> Result<()> {
        self.sessions.start(session_id, connection_id, target, options)
    }

    /// Abort a session's stream and terminate its filter, if any
    pub fn stop_log_stream(&self, session_id: &str) {
        self.sessions.stop(session_id);
        self.teardown_filter(session_id);
    }

    /// Stop every session and filter (bulk teardown)
    pub fn stop_all(&self) {
        self.sessions.stop_all();
        self.sandbox.stop_all();
        self.tunnels.close_all();
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.sessions.is_streaming(session_id)
    }

    /// Raw per-session events (`Data`, `Error`, `Closed`)
    pub fn subscribe_session_events(
        &self,
        session_id: &str,
    ) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.session_events.subscribe(session_id)
    }

    // ------------------------------------------------------------------
    // Shell filters
    // ------------------------------------------------------------------

    /// Validate and start an external filter pipeline for a session.
    ///
    /// While the filter runs, the session's feed shows only its output;
    /// the raw buffer keeps accumulating underneath.
    pub fn start_shell_filter(&self, session_id: &str, command: &str) -> Result<()> {
        // Subscribe before spawning so a filter that exits immediately
        // cannot emit into a subscriber-less hub.
        let mut rx = self.sandbox_events.subscribe(session_id);
        if let Err(e) = self.sandbox.start(session_id, command) {
            self.sandbox_events.remove(session_id);
            return Err(e);
        }
        self.feed.set_external_mode(session_id, true);

        // Pump sandbox output into the feed and on to subscribers. The
        // pump ends when its hub channel is replaced or removed.
        let feed = Arc::clone(&self.feed);
        let filter_events = Arc::clone(&self.filter_events);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let sid = event.session_id().to_string();
                if let FilterEvent::Data { session_id, line } = &event {
                    feed.push_external(session_id, line);
                }
                filter_events.emit(&sid, event);
            }
        });

        Ok(())
    }

    /// Stop a session's filter and revert its feed to the raw buffer
    pub fn stop_shell_filter(&self, session_id: &str) {
        self.teardown_filter(session_id);
    }

    /// Write bytes to a session's filter stdin; false when none is live
    pub async fn write_to_filter(&self, session_id: &str, data: &str) -> bool {
        self.sandbox.write(session_id, data).await
    }

    /// Filtered stdout and stderr/exit diagnostics per session
    pub fn subscribe_filter_events(
        &self,
        session_id: &str,
    ) -> mpsc::UnboundedReceiver<FilterEvent> {
        self.filter_events.subscribe(session_id)
    }

    fn teardown_filter(&self, session_id: &str) {
        self.sandbox.stop(session_id);
        self.sandbox_events.remove(session_id);
        self.feed.set_external_mode(session_id, false);
    }

    // ------------------------------------------------------------------
    // Render feed
    // ------------------------------------------------------------------

    pub fn feed(&self) -> &RenderFeed {
        &self.feed
    }

    pub fn snapshot(&self, session_id: &str) -> FeedSnapshot {
        self.feed.snapshot(session_id)
    }

    pub fn set_filter_expression(&self, session_id: &str, expression: &str) {
        self.feed.set_filter_expression(session_id, expression);
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> LogEngine {
        LogEngine::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn test_stop_unknown_stream_is_noop() {
        let engine = engine();
        engine.stop_log_stream("ghost");
        assert!(!engine.is_streaming("ghost"));
    }

    #[tokio::test]
    async fn test_shell_filter_rejected_command_leaves_feed_raw() {
        let engine = engine();
        engine.feed().push("s1", "raw line\n");

        let err = engine.start_shell_filter("s1", "rm -rf /").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let snap = engine.snapshot("s1");
        assert!(!snap.external);
        assert_eq!(snap.lines.len(), 1);
    }

    #[tokio::test]
    async fn test_shell_filter_output_drives_feed_until_stopped() {
        let engine = engine();
        engine.feed().push("s1", "line 1\nline 2 foo\nline 3\n");

        engine.start_shell_filter("s1", "cat").unwrap();
        assert!(engine.write_to_filter("s1", "line 2 foo\n").await);

        // Wait for the pump to land the filtered line in the feed
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snap = engine.snapshot("s1");
            if snap.external && !snap.lines.is_empty() {
                assert_eq!(snap.lines[0].raw, "line 2 foo");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "filter output never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        engine.stop_shell_filter("s1");
        let snap = engine.snapshot("s1");
        assert!(!snap.external);
        assert_eq!(snap.lines.len(), 3);
    }

    #[tokio::test]
    async fn test_pattern_filter_end_to_end() {
        let engine = engine();
        engine.feed().push("a", "one\ntwo foo\nthree\n");

        engine.set_filter_expression("a", r#"grep "foo""#);
        let snap = engine.snapshot("a");
        assert_eq!(snap.lines.len(), 1);
        assert_eq!(snap.lines[0].raw, "two foo");

        engine.set_filter_expression("a", "");
        let snap = engine.snapshot("a");
        assert_eq!(
            snap.lines.iter().map(|l| l.raw.as_str()).collect::<Vec<_>>(),
            vec!["one", "two foo", "three"]
        );
    }

    #[tokio::test]
    async fn test_write_to_filter_without_filter() {
        let engine = engine();
        assert!(!engine.write_to_filter("s1", "data\n").await);
    }

    #[tokio::test]
    async fn test_instant_filter_exit_reaches_subscriber() {
        let engine = engine();
        let mut rx = engine.subscribe_filter_events("s1");

        // grep with no pattern exits immediately with a usage error; the
        // exit diagnostic must not be lost to a not-yet-wired pump
        engine.start_shell_filter("s1", "grep").unwrap();

        let mut saw_exit = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            if let FilterEvent::Exited { code, .. } = event {
                assert_ne!(code, Some(0));
                saw_exit = true;
                break;
            }
        }
        assert!(saw_exit);
    }
}
