use std::sync::LazyLock;

use regex::Regex;

use kubemux_types::{LineSegment, ParsedLogLine};

// Timestamp patterns are tried in order; the first match wins.
static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
});

static SPACED_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}[-/]\d{2}[-/]\d{2} \d{2}:\d{2}:\d{2}(?:[.,]\d+)?").unwrap()
});

static BRACKETED_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[^\]]*\d{2}:\d{2}:\d{2}[^\]]*\]").unwrap());

static ERROR_HEURISTIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|exception|fail|fatal").unwrap());

static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

/// Classify a raw log line: leading timestamp span, error heuristic, and
/// link segmentation of the payload.
///
/// The error heuristic is only evaluated when no timestamp matched, so a
/// timestamped line is never flagged by its message content alone.
pub fn classify(raw: &str) -> ParsedLogLine {
    let timestamp_match = ISO_TIMESTAMP
        .find(raw)
        .or_else(|| SPACED_TIMESTAMP.find(raw))
        .or_else(|| BRACKETED_TIMESTAMP.find(raw));

    let (timestamp, timestamp_end) = match timestamp_match {
        Some(m) => (Some(m.as_str().to_string()), m.end()),
        None => (None, 0),
    };

    let is_error = timestamp.is_none() && ERROR_HEURISTIC.is_match(raw);

    let segments = segment_links(&raw[timestamp_end..]);

    ParsedLogLine {
        raw: raw.to_string(),
        timestamp,
        timestamp_end,
        is_error,
        segments,
    }
}

/// Split a payload into text and URL spans for link rendering
fn segment_links(payload: &str) -> Vec<LineSegment> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    for m in URL.find_iter(payload) {
        if m.start() > cursor {
            segments.push(LineSegment::Text(payload[cursor..m.start()].to_string()));
        }
        segments.push(LineSegment::Link(m.as_str().to_string()));
        cursor = m.end();
    }

    if cursor < payload.len() {
        segments.push(LineSegment::Text(payload[cursor..].to_string()));
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_with_millis() {
        let line = classify("2024-01-01T12:00:00.123Z something happened");
        assert_eq!(line.timestamp.as_deref(), Some("2024-01-01T12:00:00.123Z"));
        assert_eq!(line.payload(), " something happened");
        assert!(!line.is_error);
    }

    #[test]
    fn test_iso_timestamp_with_offset() {
        let line = classify("2024-01-01T12:00:00+02:00 started");
        assert_eq!(line.timestamp.as_deref(), Some("2024-01-01T12:00:00+02:00"));
    }

    #[test]
    fn test_spaced_timestamp() {
        let line = classify("2024/01/15 10:30:00.500 request served");
        assert_eq!(line.timestamp.as_deref(), Some("2024/01/15 10:30:00.500"));
        assert_eq!(line.payload(), " request served");
    }

    #[test]
    fn test_bracketed_timestamp() {
        let line = classify("[2024-01-15 10:30:00] worker ready");
        assert_eq!(line.timestamp.as_deref(), Some("[2024-01-15 10:30:00]"));
    }

    #[test]
    fn test_error_heuristic_without_timestamp() {
        let line = classify("Exception in thread main");
        assert!(line.timestamp.is_none());
        assert!(line.is_error);
    }

    #[test]
    fn test_error_heuristic_case_insensitive() {
        assert!(classify("request FAILED hard").is_error);
        assert!(classify("fatal: cannot continue").is_error);
    }

    #[test]
    fn test_plain_line_not_error() {
        let line = classify("all good here");
        assert!(line.timestamp.is_none());
        assert!(!line.is_error);
    }

    #[test]
    fn test_timestamped_line_skips_error_heuristic() {
        let line = classify("2024-01-01T12:00:00Z error budget report");
        assert!(line.timestamp.is_some());
        assert!(!line.is_error);
    }

    #[test]
    fn test_url_segmentation() {
        let line = classify("see https://example.com/doc for details");
        assert_eq!(
            line.segments,
            vec![
                LineSegment::Text("see ".to_string()),
                LineSegment::Link("https://example.com/doc".to_string()),
                LineSegment::Text(" for details".to_string()),
            ]
        );
    }

    #[test]
    fn test_url_after_timestamp_prefix() {
        let line = classify("2024-01-01T00:00:00Z hit http://10.0.0.1:8080/healthz");
        assert_eq!(
            line.segments,
            vec![
                LineSegment::Text(" hit ".to_string()),
                LineSegment::Link("http://10.0.0.1:8080/healthz".to_string()),
            ]
        );
    }
}
