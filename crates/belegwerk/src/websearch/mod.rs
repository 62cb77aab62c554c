//! SearXNG-style meta-search client with TTL caching.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{FallbackCache, KvBackend};
use crate::config::WebSearchConfig;
use crate::error::{Error, Result};
use crate::types::WebSearchResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchOptions {
    pub categories: String,
    pub language: String,
    pub safesearch: u8,
    pub time_range: Option<String>,
    pub max_results: usize,
}

impl SearchOptions {
    pub fn general(language: &str, max_results: usize) -> Self {
        Self {
            categories: "general".to_string(),
            language: language.to_string(),
            safesearch: 1,
            time_range: None,
            max_results,
        }
    }

    pub fn news(language: &str, max_results: usize) -> Self {
        Self {
            categories: "news".to_string(),
            language: language.to_string(),
            safesearch: 1,
            time_range: Some("month".to_string()),
            max_results,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxHit>,
}

#[derive(Debug, Deserialize)]
struct SearxHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    engine: String,
    #[serde(default)]
    score: f32,
    #[serde(rename = "publishedDate")]
    published_date: Option<String>,
    #[serde(default)]
    category: String,
}

/// The search seam the orchestration depends on; the production impl is
/// [`MetaSearchClient`], tests substitute scripted providers.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, options: &SearchOptions)
        -> Result<Vec<WebSearchResult>>;
}

pub struct MetaSearchClient {
    client: Client,
    config: WebSearchConfig,
    cache: FallbackCache,
}

#[async_trait]
impl SearchProvider for MetaSearchClient {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<WebSearchResult>> {
        MetaSearchClient::search(self, query, options).await
    }
}

impl MetaSearchClient {
    pub fn new(config: WebSearchConfig, kv: Option<Arc<dyn KvBackend>>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Permanent(format!("meta-search client: {e}")))?;

        let cache = FallbackCache::new(kv, config.cache_capacity);
        Ok(Self {
            client,
            config,
            cache,
        })
    }

    /// Query the aggregator, serving from cache when fresh. Failures are
    /// typed so callers can decide what degrades and what aborts.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<WebSearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidInput("empty search query".into()));
        }

        let key = cache_key(query, options);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(results) = serde_json::from_str::<Vec<WebSearchResult>>(&cached) {
                tracing::debug!(query, "meta-search cache hit");
                return Ok(results);
            }
        }

        let results = self.fetch(query, options).await?;

        let ttl = if options.categories.contains("news") {
            Duration::from_secs(self.config.news_cache_ttl_secs)
        } else {
            Duration::from_secs(self.config.cache_ttl_secs)
        };
        if let Ok(serialized) = serde_json::to_string(&results) {
            self.cache.set_ex(&key, ttl, &serialized).await;
        }

        Ok(results)
    }

    async fn fetch(&self, query: &str, options: &SearchOptions) -> Result<Vec<WebSearchResult>> {
        let safesearch = options.safesearch.to_string();
        let mut request = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("categories", options.categories.as_str()),
                ("language", options.language.as_str()),
                ("safesearch", safesearch.as_str()),
            ]);
        if let Some(ref range) = options.time_range {
            request = request.query(&[("time_range", range.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_http(e, "meta-search"))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Transient(format!("meta-search: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Permanent(format!("meta-search: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transient(format!("meta-search body: {e}")))?;
        let parsed: SearxResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Permanent(format!("meta-search returned non-JSON payload: {e}")))?;

        Ok(normalize_results(
            parsed.results,
            &options.categories,
            options.max_results,
        ))
    }
}

/// Stable cache key over the canonicalized query and options.
pub fn cache_key(query: &str, options: &SearchOptions) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        query.trim().to_lowercase(),
        options.categories,
        options.language,
        options.safesearch,
        options.time_range.as_deref().unwrap_or(""),
        options.max_results,
    );
    let digest = Sha256::digest(canonical.as_bytes());
    format!("websearch:{}", hex::encode(digest))
}

fn normalize_results(
    hits: Vec<SearxHit>,
    category: &str,
    max_results: usize,
) -> Vec<WebSearchResult> {
    hits.into_iter()
        .filter(|hit| !hit.url.is_empty())
        .take(max_results)
        .enumerate()
        .map(|(rank, hit)| WebSearchResult {
            rank,
            domain: domain_of(&hit.url),
            title: hit.title,
            url: hit.url,
            snippet: hit.content,
            content: None,
            engine: hit.engine,
            score: hit.score,
            published_date: hit.published_date,
            category: if hit.category.is_empty() {
                category.to_string()
            } else {
                hit.category
            },
        })
        .collect()
}

fn domain_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_default()
}

/// Route temporally or regionally cued queries to the news category with a
/// tightened time range.
pub fn intelligent_options(query: &str, base: &SearchOptions) -> SearchOptions {
    const TEMPORAL_CUES: [&str; 8] = [
        "aktuell", "neueste", "heute", "diese woche", "news", "2025", "2026", "jüngste",
    ];
    let lowered = query.to_lowercase();
    if TEMPORAL_CUES.iter().any(|cue| lowered.contains(cue)) {
        let mut tuned = base.clone();
        tuned.categories = "news".to_string();
        tuned.time_range = Some("month".to_string());
        return tuned;
    }
    base.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_and_option_sensitive() {
        let options = SearchOptions::general("de", 10);
        let a = cache_key("Klimaschutz Freiburg", &options);
        let b = cache_key("  klimaschutz freiburg ", &options);
        assert_eq!(a, b, "whitespace and case are canonicalized");

        let news = SearchOptions::news("de", 10);
        assert_ne!(a, cache_key("Klimaschutz Freiburg", &news));
    }

    #[test]
    fn normalization_fills_rank_domain_and_category() {
        let hits = vec![
            SearxHit {
                title: "Treffer".into(),
                url: "https://www.badische-zeitung.de/artikel".into(),
                content: "Ausschnitt".into(),
                engine: "duckduckgo".into(),
                score: 1.5,
                published_date: None,
                category: String::new(),
            },
            SearxHit {
                title: "Ohne URL".into(),
                url: String::new(),
                content: String::new(),
                engine: String::new(),
                score: 0.0,
                published_date: None,
                category: String::new(),
            },
        ];
        let results = normalize_results(hits, "general", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rank, 0);
        assert_eq!(results[0].domain, "badische-zeitung.de");
        assert_eq!(results[0].category, "general");
    }

    #[test]
    fn temporal_cues_route_to_news() {
        let base = SearchOptions::general("de", 10);
        let tuned = intelligent_options("Aktuelle Entwicklungen Verkehrswende", &base);
        assert_eq!(tuned.categories, "news");
        assert_eq!(tuned.time_range.as_deref(), Some("month"));

        let untouched = intelligent_options("Geschichte der Stadtplanung", &base);
        assert_eq!(untouched.categories, "general");
    }
}
