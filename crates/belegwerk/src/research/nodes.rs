//! Graph nodes between planning and drafting: web-search fan-out, crawl
//! decisions, content enrichment, grundsatz search, and aggregation.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::state::{AggregatedSource, ResearchState, StateDelta, SubQueryResults};
use crate::config::ResearchConfig;
use crate::crawler::{CrawlOptions, PageFetcher};
use crate::llm::{strip_json_fences, LanguageModel, LlmMessage, LlmOptions, LlmRequest};
use crate::retrieve::{HybridRetriever, RetrieveOptions};
use crate::types::{CrawlDecision, ExpectedValue, WebSearchResult};
use crate::websearch::{intelligent_options, SearchOptions, SearchProvider};

/// Domains whose content sits behind a paywall; crawling them wastes budget.
const PAYWALLED_DOMAINS: [&str; 7] = [
    "faz.net",
    "handelsblatt.com",
    "wsj.com",
    "nytimes.com",
    "ft.com",
    "zeit.de",
    "sueddeutsche.de",
];

/// Fan the sub-queries out to the meta-search, bounded concurrency, failures
/// isolated per sub-query.
pub async fn web_search_node(
    state: &ResearchState,
    client: &Arc<dyn SearchProvider>,
    base_options: &SearchOptions,
    concurrency: usize,
) -> StateDelta {
    let searches = state.sub_queries.iter().cloned().map(|sub_query| {
        let client = Arc::clone(client);
        let options = intelligent_options(&sub_query, base_options);
        async move {
            let outcome = client.search(&sub_query, &options).await;
            (sub_query, outcome)
        }
    });

    let outcomes: Vec<(String, crate::error::Result<Vec<WebSearchResult>>)> =
        futures::stream::iter(searches)
            .buffer_unordered(concurrency.clamp(1, 8))
            .collect()
            .await;

    // Restore sub-query order; concurrency must not reorder the state.
    let mut by_query: HashMap<String, crate::error::Result<Vec<WebSearchResult>>> =
        outcomes.into_iter().collect();

    let mut web_results = Vec::with_capacity(state.sub_queries.len());
    let mut errors = Vec::new();
    for sub_query in &state.sub_queries {
        match by_query.remove(sub_query) {
            Some(Ok(results)) => web_results.push(SubQueryResults {
                sub_query: sub_query.clone(),
                results,
            }),
            Some(Err(e)) => {
                errors.push(format!("web search '{sub_query}' failed: {e}"));
                web_results.push(SubQueryResults {
                    sub_query: sub_query.clone(),
                    results: Vec::new(),
                });
            }
            None => web_results.push(SubQueryResults {
                sub_query: sub_query.clone(),
                results: Vec::new(),
            }),
        }
    }

    StateDelta {
        web_results: Some(web_results),
        errors,
        ..StateDelta::default()
    }
}

/// Ask the model which of the first sub-query's results deserve a full
/// crawl; fall back to top-N by rank. Paywalled domains are excluded either
/// way.
pub async fn crawl_decision_node(
    state: &ResearchState,
    llm: &Arc<dyn LanguageModel>,
    max_crawls: usize,
) -> StateDelta {
    let Some(first) = state.web_results.first() else {
        return StateDelta::default();
    };
    let candidates: Vec<&WebSearchResult> = first
        .results
        .iter()
        .filter(|r| !is_paywalled(&r.domain))
        .collect();
    if candidates.is_empty() {
        return StateDelta::default();
    }

    let listing = candidates
        .iter()
        .map(|r| {
            format!(
                "{}: {} — {} ({})",
                r.rank,
                r.title,
                truncate(&r.snippet, 160),
                r.url
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Suchanfrage: {}\n\nErgebnisse:\n{listing}\n\n\
         Wähle bis zu {max_crawls} Ergebnisse, deren vollständiger Inhalt die Antwort \
         wesentlich verbessern würde. Antworte NUR mit einem JSON-Array von Objekten \
         {{\"index\": <rank>, \"reason\": \"...\", \"value\": \"high|medium|low\"}}.",
        state.query
    );

    let request = LlmRequest {
        request_type: "crawl_decision".to_string(),
        system_prompt: Some("Du entscheidest über Crawling-Budget. Antworte nur mit JSON.".into()),
        messages: vec![LlmMessage::user(prompt)],
        options: LlmOptions {
            max_tokens: 400,
            temperature: 0.2,
            tools: None,
        },
    };

    let decisions = match llm.process(request).await {
        Ok(response) => response
            .text()
            .and_then(|content| parse_decisions(content, &candidates, max_crawls)),
        Err(e) => {
            tracing::warn!(error = %e, "crawl decision LLM call failed");
            None
        }
    };

    let decisions = decisions.unwrap_or_else(|| top_n_fallback(&candidates, max_crawls));

    StateDelta {
        crawl_decisions: Some(decisions),
        ..StateDelta::default()
    }
}

fn parse_decisions(
    raw: &str,
    candidates: &[&WebSearchResult],
    max_crawls: usize,
) -> Option<Vec<CrawlDecision>> {
    #[derive(serde::Deserialize)]
    struct RawDecision {
        index: usize,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        value: String,
    }

    let parsed: Vec<RawDecision> = serde_json::from_str(strip_json_fences(raw)).ok()?;
    let by_rank: HashMap<usize, &&WebSearchResult> =
        candidates.iter().map(|r| (r.rank, r)).collect();

    let decisions: Vec<CrawlDecision> = parsed
        .into_iter()
        .filter_map(|raw| {
            let result = by_rank.get(&raw.index)?;
            Some(CrawlDecision {
                result_index: raw.index,
                url: result.url.clone(),
                reason: raw.reason,
                expected_value: match raw.value.as_str() {
                    "high" => ExpectedValue::High,
                    "low" => ExpectedValue::Low,
                    _ => ExpectedValue::Medium,
                },
            })
        })
        .take(max_crawls)
        .collect();

    (!decisions.is_empty()).then_some(decisions)
}

fn top_n_fallback(candidates: &[&WebSearchResult], max_crawls: usize) -> Vec<CrawlDecision> {
    candidates
        .iter()
        .take(max_crawls)
        .map(|r| CrawlDecision {
            result_index: r.rank,
            url: r.url.clone(),
            reason: "top-ranked result".to_string(),
            expected_value: ExpectedValue::Medium,
        })
        .collect()
}

pub fn is_paywalled(domain: &str) -> bool {
    PAYWALLED_DOMAINS
        .iter()
        .any(|pay| domain == *pay || domain.ends_with(&format!(".{pay}")))
}

/// Crawl the decided URLs in parallel with a per-crawl timeout, then merge
/// full content into the first sub-query's results without disturbing their
/// ranking.
pub async fn enrich_node(
    state: &ResearchState,
    crawler: &Arc<dyn PageFetcher>,
    timeout: Duration,
    content_cap: usize,
) -> StateDelta {
    let Some(first) = state.web_results.first() else {
        return StateDelta::default();
    };

    let mut errors = Vec::new();
    let crawls = state.crawl_decisions.iter().map(|decision| {
        let crawler = Arc::clone(crawler);
        let url = decision.url.clone();
        let options = CrawlOptions {
            timeout: Some(timeout),
            max_content_chars: Some(content_cap),
            enhanced_metadata: false,
        };
        async move {
            let result =
                match tokio::time::timeout(timeout + Duration::from_millis(500), async {
                    crawler.crawl(&url, &options).await
                })
                .await
                {
                    Ok(result) => result,
                    Err(_) => crate::crawler::CrawlResult::failure(&url, 0, "crawl timeout".into()),
                };
            (url, result)
        }
    });

    let crawled: Vec<(String, crate::crawler::CrawlResult)> = futures::stream::iter(crawls)
        .buffer_unordered(state.crawl_decisions.len().max(1))
        .collect()
        .await;

    let mut content_by_url: HashMap<String, String> = HashMap::new();
    for (url, result) in crawled {
        if result.success {
            content_by_url.insert(url, result.markdown);
        } else {
            errors.push(format!(
                "crawl {url} failed: {}",
                result.error.unwrap_or_else(|| "unknown".into())
            ));
        }
    }

    let enriched: Vec<WebSearchResult> = first
        .results
        .iter()
        .map(|result| {
            let mut enriched = result.clone();
            if let Some(content) = content_by_url.remove(&result.url) {
                enriched.content = Some(content);
            }
            enriched
        })
        .collect();

    StateDelta {
        enriched_results: Some(enriched),
        errors,
        ..StateDelta::default()
    }
}

/// Deep mode only: search the curated official-documents collection. Never
/// fatal.
pub async fn grundsatz_node(
    state: &ResearchState,
    retriever: &Arc<HybridRetriever>,
    collection: &str,
    owner: &str,
) -> StateDelta {
    let options = RetrieveOptions::hybrid(3);
    match retriever
        .search_in(collection, &state.query, owner, &options)
        .await
    {
        Ok(outcome) => StateDelta {
            grundsatz_results: Some(outcome),
            ..StateDelta::default()
        },
        Err(e) => {
            tracing::warn!(error = %e, "grundsatz search failed");
            StateDelta::error(format!("grundsatz search failed: {e}"))
        }
    }
}

/// Deduplicate external sources by URL across all sub-queries, recording the
/// first-seen rank and every producing sub-query; official documents get
/// their own category.
pub fn aggregate_node(state: &ResearchState) -> StateDelta {
    let mut by_url: HashMap<String, AggregatedSource> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    // Enriched results carry crawled content for the first sub-query.
    let enriched_content: HashMap<&str, &str> = state
        .enriched_results
        .iter()
        .filter_map(|r| r.content.as_deref().map(|c| (r.url.as_str(), c)))
        .collect();

    for per_query in &state.web_results {
        for result in &per_query.results {
            match by_url.get_mut(&result.url) {
                Some(existing) => {
                    if !existing.sub_queries.contains(&per_query.sub_query) {
                        existing.sub_queries.push(per_query.sub_query.clone());
                    }
                }
                None => {
                    order.push(result.url.clone());
                    by_url.insert(
                        result.url.clone(),
                        AggregatedSource {
                            url: result.url.clone(),
                            title: result.title.clone(),
                            snippet: result.snippet.clone(),
                            content: enriched_content
                                .get(result.url.as_str())
                                .map(|c| c.to_string()),
                            domain: result.domain.clone(),
                            category: result.category.clone(),
                            first_seen_rank: result.rank,
                            sub_queries: vec![per_query.sub_query.clone()],
                        },
                    );
                }
            }
        }
    }

    let aggregated: Vec<AggregatedSource> = order
        .into_iter()
        .filter_map(|url| by_url.remove(&url))
        .collect();

    let mut categorized: HashMap<String, Vec<String>> = HashMap::new();
    for source in &aggregated {
        categorized
            .entry(source.category.clone())
            .or_default()
            .push(source.url.clone());
    }
    if let Some(ref grundsatz) = state.grundsatz_results {
        let titles: Vec<String> = grundsatz
            .results
            .iter()
            .map(|r| r.title.clone())
            .filter(|t| !t.is_empty())
            .collect();
        if !titles.is_empty() {
            categorized.insert("grundsatz".to_string(), titles);
        }
    }

    StateDelta {
        aggregated_results: Some(aggregated),
        categorized_sources: Some(categorized),
        ..StateDelta::default()
    }
}

fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        text.chars().take(cap).collect()
    }
}

/// Bound the research config's crawl limit to the mode.
pub fn crawl_limit(config: &ResearchConfig, deep: bool) -> usize {
    if deep {
        config.deep_crawl_limit
    } else {
        config.normal_crawl_limit
    }
}
