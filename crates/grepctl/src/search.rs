//! `grepctl search`: run a query and print ranked results.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use grepctl_core::models::{SearchFilters, SearchQuery};
use grepctl_core::rerank::snippet;

use crate::config::Config;
use crate::engine::open_engine;
use crate::index_cmd::format_ts;

/// Options collected from the command line.
#[derive(Debug, Default)]
pub struct SearchArgs {
    pub query: String,
    pub top_k: Option<usize>,
    pub sources: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub regex: Option<String>,
    pub rerank: bool,
    pub json: bool,
}

/// Start of `date` (UTC), from `YYYY-MM-DD`.
pub fn parse_since(date: &str) -> Result<i64> {
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid --since date '{}', expected YYYY-MM-DD", date))?;
    d.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .context("invalid --since date")
}

/// Last second of `date` (UTC), from `YYYY-MM-DD`.
pub fn parse_until(date: &str) -> Result<i64> {
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid --until date '{}', expected YYYY-MM-DD", date))?;
    d.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc().timestamp())
        .context("invalid --until date")
}

pub fn build_query(config: &Config, args: &SearchArgs) -> Result<SearchQuery> {
    if args.rerank && !config.rerank.is_enabled() {
        bail!("--rerank requires a [rerank] provider in config");
    }
    Ok(SearchQuery {
        text: args.query.clone(),
        top_k: args.top_k.unwrap_or(config.retrieval.default_top_k),
        filters: SearchFilters {
            sources: args.sources.clone(),
            start_ts: args.since.as_deref().map(parse_since).transpose()?,
            end_ts: args.until.as_deref().map(parse_until).transpose()?,
            regex: args.regex.clone(),
        },
        rerank: args.rerank,
    })
}

pub async fn run_search(config: &Config, args: &SearchArgs) -> Result<()> {
    let query = build_query(config, args)?;
    let engine = open_engine(config).await?;
    let outcome = engine.search(&query).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for result in &outcome.results {
        let e = &result.entry;
        match result.relevance_score {
            Some(score) => println!(
                "{}. [{:.3}] distance {:.4}  {}",
                result.rank, score, result.distance, e.uri
            ),
            None => println!("{}. distance {:.4}  {}", result.rank, result.distance, e.uri),
        }
        println!("    id: {}", e.id);
        println!("    source: {}  created: {}", e.source, format_ts(e.created_at));
        let preview = snippet(&e.text, 200).replace('\n', " ");
        println!("    > {}", preview);
        println!();
    }

    let s = &outcome.stats;
    println!(
        "{} results ({} search, {} candidates fetched, {} after filters{})",
        outcome.results.len(),
        s.mode,
        s.candidates_fetched,
        s.candidates_after_filter,
        if s.reranked {
            format!(", reranked with {} failures", s.rerank_failures)
        } else {
            String::new()
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_date_bounds_are_inclusive_days() {
        assert_eq!(parse_since("1970-01-02").unwrap(), 86_400);
        assert_eq!(parse_until("1970-01-01").unwrap(), 86_399);
        assert!(parse_since("01/02/1970").is_err());
    }

    #[test]
    fn test_build_query_defaults_and_filters() {
        let config = parse_config("[db]\npath = \"x.sqlite\"\n").unwrap();
        let args = SearchArgs {
            query: "invoice".to_string(),
            sources: vec!["pdf".to_string()],
            since: Some("2024-01-01".to_string()),
            ..Default::default()
        };
        let q = build_query(&config, &args).unwrap();
        assert_eq!(q.top_k, 10);
        assert_eq!(q.filters.sources, vec!["pdf".to_string()]);
        assert_eq!(q.filters.start_ts, Some(1_704_067_200));
        assert!(q.filters.end_ts.is_none());
    }

    #[test]
    fn test_rerank_requires_provider() {
        let config = parse_config("[db]\npath = \"x.sqlite\"\n").unwrap();
        let args = SearchArgs {
            query: "q".to_string(),
            rerank: true,
            ..Default::default()
        };
        assert!(build_query(&config, &args).is_err());
    }
}
