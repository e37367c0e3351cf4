use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use kubemux_types::ParsedLogLine;

use crate::classify::classify;
use crate::pattern::{self, FilterStage};

/// Ring buffer bound per session
pub const RING_CAPACITY: usize = 50_000;

/// Default flush coalescing interval (one display frame)
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(33);

/// Rows from the bottom within which a consumer still counts as "at bottom"
pub const DEFAULT_BOTTOM_TOLERANCE: usize = 3;

/// A consistent view of one session's displayed lines
#[derive(Clone)]
pub struct FeedSnapshot {
    /// Visible lines after the active filter mode is applied
    pub lines: Vec<Arc<ParsedLogLine>>,
    /// Monotonic revision, bumped on every flush that changed the view
    pub revision: u64,
    /// Whether the consumer is stuck to the bottom
    pub follow: bool,
    /// Whether the view shows external filter-process output
    pub external: bool,
}

struct SessionFeed {
    /// Raw ring buffer, oldest-eviction beyond capacity
    raw: RwLock<VecDeque<Arc<ParsedLogLine>>>,

    /// Raw lines passing the pattern pipeline, in buffer order
    visible: RwLock<Vec<Arc<ParsedLogLine>>>,

    /// Filter-process output ring, shown instead of raw while a filter runs
    external: RwLock<VecDeque<Arc<ParsedLogLine>>>,

    /// Classified lines awaiting the next frame-aligned flush
    pending: Mutex<Vec<Arc<ParsedLogLine>>>,
    pending_external: Mutex<Vec<Arc<ParsedLogLine>>>,

    /// Compiled pattern pipeline stages (empty = permissive)
    stages: RwLock<Vec<FilterStage>>,

    external_mode: AtomicBool,
    follow: AtomicBool,

    revision: watch::Sender<u64>,
    flusher: CancellationToken,
}

impl SessionFeed {
    fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            raw: RwLock::new(VecDeque::new()),
            visible: RwLock::new(Vec::new()),
            external: RwLock::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            pending_external: Mutex::new(Vec::new()),
            stages: RwLock::new(Vec::new()),
            external_mode: AtomicBool::new(false),
            follow: AtomicBool::new(true),
            revision,
            flusher: CancellationToken::new(),
        }
    }
}

/// Per-session bounded line store with batched, frame-aligned flushing.
///
/// Incoming chunks are split, classified, and staged; a per-session flusher
/// coalesces appends to at most one buffer update per frame interval so a
/// hot stream cannot flood the consumer. Reads flush first, so snapshots are
/// always current.
pub struct RenderFeed {
    sessions: RwLock<HashMap<String, Arc<SessionFeed>>>,
    capacity: usize,
    flush_interval: Duration,
    bottom_tolerance: usize,
}

impl RenderFeed {
    pub fn new(capacity: usize, flush_interval: Duration, bottom_tolerance: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity,
            flush_interval,
            bottom_tolerance,
        }
    }

    fn feed_for(&self, session_id: &str) -> Arc<SessionFeed> {
        if let Some(feed) = self.sessions.read().get(session_id) {
            return Arc::clone(feed);
        }

        let mut sessions = self.sessions.write();
        let feed = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionFeed::new()));
        let feed = Arc::clone(feed);

        // Frame-aligned flusher for this session
        {
            let feed = Arc::clone(&feed);
            let capacity = self.capacity;
            let interval = self.flush_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = feed.flusher.cancelled() => break,
                        _ = ticker.tick() => {
                            flush_session(&feed, capacity);
                        }
                    }
                }
            });
        }

        feed
    }

    /// Stage a raw chunk: split on newlines, drop blanks, classify each line
    pub fn push(&self, session_id: &str, raw_chunk: &str) {
        let feed = self.feed_for(session_id);
        let mut pending = feed.pending.lock();
        for line in raw_chunk.lines() {
            if line.trim().is_empty() {
                continue;
            }
            pending.push(Arc::new(classify(line)));
        }
    }

    /// Stage one filter-process output line, classified the same way as raw
    pub fn push_external(&self, session_id: &str, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let feed = self.feed_for(session_id);
        feed.pending_external.lock().push(Arc::new(classify(line)));
    }

    /// Replace the session's pattern pipeline and re-apply it to the whole
    /// buffer. An empty expression removes the filter.
    pub fn set_filter_expression(&self, session_id: &str, expression: &str) {
        let feed = self.feed_for(session_id);
        flush_session(&feed, self.capacity);

        let stages = pattern::parse(expression);
        {
            let raw = feed.raw.read();
            let mut visible = feed.visible.write();
            *visible = raw
                .iter()
                .filter(|line| pattern::apply(&line.raw, &stages))
                .cloned()
                .collect();
        }
        *feed.stages.write() = stages;
        feed.revision.send_modify(|r| *r += 1);
    }

    /// Switch between showing the raw buffer and filter-process output.
    ///
    /// Enabling starts from an empty external view; disabling reverts to
    /// the raw buffer, which kept accumulating throughout.
    pub fn set_external_mode(&self, session_id: &str, enabled: bool) {
        let feed = self.feed_for(session_id);
        if enabled {
            feed.external.write().clear();
            feed.pending_external.lock().clear();
        }
        feed.external_mode.store(enabled, Ordering::SeqCst);
        feed.revision.send_modify(|r| *r += 1);
    }

    /// Current view of the session. Flushes staged lines first.
    pub fn snapshot(&self, session_id: &str) -> FeedSnapshot {
        let feed = self.feed_for(session_id);
        flush_session(&feed, self.capacity);

        let external = feed.external_mode.load(Ordering::SeqCst);
        let lines = if external {
            feed.external.read().iter().cloned().collect()
        } else {
            feed.visible.read().clone()
        };

        FeedSnapshot {
            lines,
            revision: *feed.revision.borrow(),
            follow: feed.follow.load(Ordering::SeqCst),
            external,
        }
    }

    /// Revision watcher for lazy, restartable subscription: await changes,
    /// then take a fresh snapshot.
    pub fn subscribe(&self, session_id: &str) -> watch::Receiver<u64> {
        self.feed_for(session_id).revision.subscribe()
    }

    /// Record how far above the bottom the consumer currently is.
    ///
    /// Within tolerance the view keeps auto-advancing; further up it is
    /// left undisturbed until the consumer returns to the bottom.
    pub fn note_scroll_position(&self, session_id: &str, rows_from_bottom: usize) {
        let feed = self.feed_for(session_id);
        feed.follow
            .store(rows_from_bottom <= self.bottom_tolerance, Ordering::SeqCst);
    }

    /// Whether the session's consumer is stuck to the bottom
    pub fn is_following(&self, session_id: &str) -> bool {
        self.feed_for(session_id).follow.load(Ordering::SeqCst)
    }

    /// Drop all buffered lines for the session, keeping filter state
    pub fn clear(&self, session_id: &str) {
        let feed = self.feed_for(session_id);
        feed.pending.lock().clear();
        feed.pending_external.lock().clear();
        feed.raw.write().clear();
        feed.visible.write().clear();
        feed.external.write().clear();
        feed.revision.send_modify(|r| *r += 1);
    }

    /// Tear down the session's feed and its flusher task
    pub fn remove(&self, session_id: &str) {
        if let Some(feed) = self.sessions.write().remove(session_id) {
            feed.flusher.cancel();
        }
    }

    /// Force a flush outside the frame schedule (reads do this implicitly)
    pub fn flush(&self, session_id: &str) {
        let feed = self.feed_for(session_id);
        flush_session(&feed, self.capacity);
    }
}

impl Drop for RenderFeed {
    fn drop(&mut self) {
        for feed in self.sessions.write().values() {
            feed.flusher.cancel();
        }
    }
}

/// Move staged lines into the ring buffers, evicting oldest entries beyond
/// capacity and keeping the filtered view consistent with the raw buffer.
fn flush_session(feed: &SessionFeed, capacity: usize) {
    let mut changed = false;

    let staged: Vec<_> = feed.pending.lock().drain(..).collect();
    if !staged.is_empty() {
        let stages = feed.stages.read();
        let mut raw = feed.raw.write();
        let mut visible = feed.visible.write();

        for line in staged {
            if raw.len() >= capacity {
                if let Some(evicted) = raw.pop_front() {
                    // The filtered view is an ordered subsequence of raw, so
                    // an evicted line can only be its front element
                    if visible
                        .first()
                        .is_some_and(|head| Arc::ptr_eq(head, &evicted))
                    {
                        visible.remove(0);
                    }
                }
            }
            if pattern::apply(&line.raw, &stages) {
                visible.push(Arc::clone(&line));
            }
            raw.push_back(line);
        }
        changed = true;
    }

    let staged_external: Vec<_> = feed.pending_external.lock().drain(..).collect();
    if !staged_external.is_empty() {
        let mut external = feed.external.write();
        for line in staged_external {
            if external.len() >= capacity {
                external.pop_front();
            }
            external.push_back(line);
        }
        changed = true;
    }

    if changed {
        feed.revision.send_modify(|r| *r += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> RenderFeed {
        RenderFeed::new(RING_CAPACITY, DEFAULT_FLUSH_INTERVAL, DEFAULT_BOTTOM_TOLERANCE)
    }

    fn small_feed(capacity: usize) -> RenderFeed {
        RenderFeed::new(capacity, DEFAULT_FLUSH_INTERVAL, DEFAULT_BOTTOM_TOLERANCE)
    }

    fn raws(snapshot: &FeedSnapshot) -> Vec<&str> {
        snapshot.lines.iter().map(|l| l.raw.as_str()).collect()
    }

    #[tokio::test]
    async fn test_push_splits_and_drops_blanks() {
        let feed = feed();
        feed.push("s", "one\n\ntwo\n   \nthree\n");
        let snap = feed.snapshot("s");
        assert_eq!(raws(&snap), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest_in_order() {
        let feed = small_feed(5);
        for i in 0..9 {
            feed.push("s", &format!("line {}\n", i));
        }
        let snap = feed.snapshot("s");
        assert_eq!(snap.lines.len(), 5);
        assert_eq!(
            raws(&snap),
            vec!["line 4", "line 5", "line 6", "line 7", "line 8"]
        );
    }

    #[tokio::test]
    async fn test_filter_applies_to_existing_buffer() {
        let feed = feed();
        feed.push("s", "alpha\nfoo beta\ngamma\n");
        feed.set_filter_expression("s", r#"grep "foo""#);
        let snap = feed.snapshot("s");
        assert_eq!(raws(&snap), vec!["foo beta"]);
    }

    #[tokio::test]
    async fn test_filter_applies_incrementally_to_new_lines() {
        let feed = feed();
        feed.set_filter_expression("s", "grep keep");
        feed.push("s", "keep 1\ndrop 1\nkeep 2\n");
        let snap = feed.snapshot("s");
        assert_eq!(raws(&snap), vec!["keep 1", "keep 2"]);
    }

    #[tokio::test]
    async fn test_clearing_filter_restores_full_buffer() {
        let feed = feed();
        feed.push("s", "line 1\nline 2 foo\nline 3\n");
        feed.set_filter_expression("s", r#"grep "foo""#);
        assert_eq!(raws(&feed.snapshot("s")), vec!["line 2 foo"]);

        feed.set_filter_expression("s", "");
        assert_eq!(
            raws(&feed.snapshot("s")),
            vec!["line 1", "line 2 foo", "line 3"]
        );
    }

    #[tokio::test]
    async fn test_eviction_keeps_filtered_view_consistent() {
        let feed = small_feed(3);
        feed.set_filter_expression("s", "grep keep");
        feed.push("s", "keep 0\ndrop 0\nkeep 1\n");
        feed.flush("s");
        // Evicts "keep 0" and "drop 0" from the raw ring
        feed.push("s", "drop 1\nkeep 2\n");
        let snap = feed.snapshot("s");
        assert_eq!(raws(&snap), vec!["keep 1", "keep 2"]);
    }

    #[tokio::test]
    async fn test_external_mode_shows_only_filter_output_then_reverts() {
        let feed = feed();
        feed.push("s", "raw 1\nraw 2\nraw 3\n");

        feed.set_external_mode("s", true);
        feed.push_external("s", "filtered 2");
        // Raw keeps accumulating underneath
        feed.push("s", "raw 4\n");

        let snap = feed.snapshot("s");
        assert!(snap.external);
        assert_eq!(raws(&snap), vec!["filtered 2"]);

        feed.set_external_mode("s", false);
        let snap = feed.snapshot("s");
        assert!(!snap.external);
        assert_eq!(raws(&snap), vec!["raw 1", "raw 2", "raw 3", "raw 4"]);
    }

    #[tokio::test]
    async fn test_external_lines_are_classified() {
        let feed = feed();
        feed.set_external_mode("s", true);
        feed.push_external("s", "2024-01-01T12:00:00.123Z something happened");
        let snap = feed.snapshot("s");
        assert_eq!(
            snap.lines[0].timestamp.as_deref(),
            Some("2024-01-01T12:00:00.123Z")
        );
    }

    #[tokio::test]
    async fn test_scroll_tolerance_controls_follow() {
        let feed = feed();
        assert!(feed.is_following("s"));

        feed.note_scroll_position("s", 50);
        assert!(!feed.is_following("s"));

        feed.note_scroll_position("s", DEFAULT_BOTTOM_TOLERANCE);
        assert!(feed.is_following("s"));

        feed.note_scroll_position("s", 0);
        assert!(feed.is_following("s"));
    }

    #[tokio::test]
    async fn test_revision_advances_on_flush() {
        let feed = feed();
        let rx = feed.subscribe("s");
        let before = *rx.borrow();
        feed.push("s", "a line\n");
        let snap = feed.snapshot("s");
        assert!(snap.revision > before);
    }

    #[tokio::test]
    async fn test_clear_empties_buffers() {
        let feed = feed();
        feed.push("s", "one\ntwo\n");
        feed.flush("s");
        feed.clear("s");
        assert!(feed.snapshot("s").lines.is_empty());
    }

    #[tokio::test]
    async fn test_flusher_task_flushes_without_reads() {
        let feed = RenderFeed::new(RING_CAPACITY, Duration::from_millis(5), 3);
        let mut rx = feed.subscribe("s");
        feed.push("s", "background line\n");
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("flusher never ran")
            .unwrap();
    }

    #[tokio::test]
    async fn test_classification_happens_on_push() {
        let feed = feed();
        feed.push("s", "Exception in thread main\n2024-01-01T00:00:00Z ok\n");
        let snap = feed.snapshot("s");
        assert!(snap.lines[0].is_error);
        assert!(snap.lines[1].timestamp.is_some());
    }
}
