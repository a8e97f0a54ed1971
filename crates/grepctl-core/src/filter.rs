//! Structured predicates applied to retrieval candidates.
//!
//! Filters are compiled once per request, before any retrieval work, so a
//! bad pattern or time range rejects the request up front. All predicates
//! are optional and combine with AND.

use regex::{Regex, RegexBuilder};

use crate::error::QueryError;
use crate::models::{CorpusEntry, SearchFilters};
use crate::retrieval::Candidate;

/// Validated, ready-to-run form of [`SearchFilters`].
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    sources: Vec<String>,
    start_ts: Option<i64>,
    end_ts: Option<i64>,
    regex: Option<Regex>,
}

impl CompiledFilters {
    pub fn compile(filters: &SearchFilters) -> Result<Self, QueryError> {
        if let (Some(start), Some(end)) = (filters.start_ts, filters.end_ts) {
            if start > end {
                return Err(QueryError::InvalidTimeRange { start, end });
            }
        }

        let regex = match filters.regex.as_deref() {
            Some(pattern) => Some(compile_full_match(pattern)?),
            None => None,
        };

        Ok(Self {
            sources: filters.sources.clone(),
            start_ts: filters.start_ts,
            end_ts: filters.end_ts,
            regex,
        })
    }

    pub fn is_noop(&self) -> bool {
        self.sources.is_empty()
            && self.start_ts.is_none()
            && self.end_ts.is_none()
            && self.regex.is_none()
    }

    pub fn matches(&self, entry: &CorpusEntry) -> bool {
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == &entry.source) {
            return false;
        }
        if self.start_ts.is_some_and(|t| entry.created_at < t) {
            return false;
        }
        if self.end_ts.is_some_and(|t| entry.created_at > t) {
            return false;
        }
        match &self.regex {
            Some(re) => re.is_match(&entry.text),
            None => true,
        }
    }

    /// Keep the candidates that match, preserving order.
    pub fn apply(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if self.is_noop() {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|c| self.matches(&c.entry))
            .collect()
    }
}

/// Anchor `pattern` so it must match the whole text.
///
/// Matching is case-insensitive and `.` crosses newlines; inline flags in
/// the pattern (e.g. `(?-i)`) take precedence.
fn compile_full_match(pattern: &str) -> Result<Regex, QueryError> {
    RegexBuilder::new(&format!(r"\A(?:{})\z", pattern))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| QueryError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;

    fn entry(source: &str, created_at: i64, text: &str) -> CorpusEntry {
        CorpusEntry {
            id: format!("{}-{}", source, created_at),
            doc_id: format!("{}-{}", source, created_at),
            uri: "file:///x".to_string(),
            modality: "text".to_string(),
            source: source.to_string(),
            created_at,
            span: None,
            text: text.to_string(),
            content_hash: content_hash(text),
            embedding: None,
            embed_attempts: 0,
            embedded_at: None,
        }
    }

    fn compile(f: SearchFilters) -> CompiledFilters {
        CompiledFilters::compile(&f).unwrap()
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let f = compile(SearchFilters::default());
        assert!(f.is_noop());
        assert!(f.matches(&entry("pdf", 0, "anything")));
    }

    #[test]
    fn test_source_set() {
        let f = compile(SearchFilters {
            sources: vec!["pdf".into(), "audio".into()],
            ..Default::default()
        });
        assert!(f.matches(&entry("pdf", 0, "x")));
        assert!(f.matches(&entry("audio", 0, "x")));
        assert!(!f.matches(&entry("image", 0, "x")));
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let f = compile(SearchFilters {
            start_ts: Some(100),
            end_ts: Some(200),
            ..Default::default()
        });
        assert!(!f.matches(&entry("a", 99, "x")));
        assert!(f.matches(&entry("a", 100, "x")));
        assert!(f.matches(&entry("a", 200, "x")));
        assert!(!f.matches(&entry("a", 201, "x")));
    }

    #[test]
    fn test_open_ended_range() {
        let f = compile(SearchFilters {
            start_ts: Some(100),
            ..Default::default()
        });
        assert!(f.matches(&entry("a", i64::MAX, "x")));
        assert!(!f.matches(&entry("a", 0, "x")));
    }

    #[test]
    fn test_regex_is_full_match() {
        let f = compile(SearchFilters {
            regex: Some("invoice".into()),
            ..Default::default()
        });
        assert!(f.matches(&entry("a", 0, "invoice")));
        assert!(!f.matches(&entry("a", 0, "the invoice total")));

        let f = compile(SearchFilters {
            regex: Some(".*invoice.*".into()),
            ..Default::default()
        });
        assert!(f.matches(&entry("a", 0, "line one\nthe invoice total\nend")));
    }

    #[test]
    fn test_regex_case_insensitive_unless_overridden() {
        let f = compile(SearchFilters {
            regex: Some("report.*".into()),
            ..Default::default()
        });
        assert!(f.matches(&entry("a", 0, "REPORT Q3")));

        let f = compile(SearchFilters {
            regex: Some("(?-i)report.*".into()),
            ..Default::default()
        });
        assert!(!f.matches(&entry("a", 0, "REPORT Q3")));
    }

    #[test]
    fn test_regex_alternation_stays_anchored() {
        let f = compile(SearchFilters {
            regex: Some("foo|bar".into()),
            ..Default::default()
        });
        assert!(f.matches(&entry("a", 0, "bar")));
        assert!(!f.matches(&entry("a", 0, "foobar baz")));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = CompiledFilters::compile(&SearchFilters {
            regex: Some("(unclosed".into()),
            ..Default::default()
        })
        .unwrap_err();
        match err {
            QueryError::InvalidRegex { pattern, message } => {
                assert_eq!(pattern, "(unclosed");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_inverted_time_range_is_rejected() {
        let err = CompiledFilters::compile(&SearchFilters {
            start_ts: Some(10),
            end_ts: Some(5),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            QueryError::InvalidTimeRange { start: 10, end: 5 }
        ));
    }

    #[test]
    fn test_predicates_are_conjunctive() {
        let f = compile(SearchFilters {
            sources: vec!["pdf".into()],
            start_ts: Some(50),
            regex: Some(".*budget.*".into()),
            ..Default::default()
        });
        assert!(f.matches(&entry("pdf", 60, "2024 budget")));
        assert!(!f.matches(&entry("pdf", 40, "2024 budget")));
        assert!(!f.matches(&entry("doc", 60, "2024 budget")));
        assert!(!f.matches(&entry("pdf", 60, "2024 plan")));
    }
}
