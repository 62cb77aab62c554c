//! Research graph state and the node delta merge policy.
//!
//! Nodes are pure with respect to the state: each receives a reference and
//! returns a [`StateDelta`]. The orchestrator merges deltas under one
//! documented policy — scalars replace, maps shallow-merge, lists replace,
//! except `errors`, which appends.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::citations::ReferenceMap;
use crate::retrieve::SearchOutcome;
use crate::types::{CitationMarker, CrawlDecision, Reference, WebSearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchMode {
    Normal,
    Deep,
}

impl ResearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(ResearchMode::Normal),
            "deep" => Some(ResearchMode::Deep),
            _ => None,
        }
    }
}

/// Results of one sub-query, ranks preserved end-to-end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubQueryResults {
    pub sub_query: String,
    pub results: Vec<WebSearchResult>,
}

/// A deduplicated external source with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSource {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub content: Option<String>,
    pub domain: String,
    pub category: String,
    /// Rank of the first producer; later producers never demote a source.
    pub first_seen_rank: usize,
    /// Which sub-queries surfaced this source.
    pub sub_queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub generated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub query: String,
    pub mode: ResearchMode,
    pub sub_queries: Vec<String>,
    pub web_results: Vec<SubQueryResults>,
    pub crawl_decisions: Vec<CrawlDecision>,
    /// First sub-query's results, crawled content merged in, ranking intact.
    pub enriched_results: Vec<WebSearchResult>,
    pub grundsatz_results: Option<SearchOutcome>,
    pub aggregated_results: Vec<AggregatedSource>,
    pub categorized_sources: HashMap<String, Vec<String>>,
    #[serde(skip)]
    pub reference_map: ReferenceMap,
    pub citations: Vec<CitationMarker>,
    pub citation_sources: Vec<Reference>,
    pub summary: Option<Summary>,
    pub dossier: Option<String>,
    pub errors: Vec<String>,
}

impl ResearchState {
    pub fn new(query: &str, mode: ResearchMode) -> Self {
        Self {
            query: query.to_string(),
            mode,
            sub_queries: Vec::new(),
            web_results: Vec::new(),
            crawl_decisions: Vec::new(),
            enriched_results: Vec::new(),
            grundsatz_results: None,
            aggregated_results: Vec::new(),
            categorized_sources: HashMap::new(),
            reference_map: ReferenceMap::default(),
            citations: Vec::new(),
            citation_sources: Vec::new(),
            summary: None,
            dossier: None,
            errors: Vec::new(),
        }
    }
}

/// What one node contributes. `None` fields leave the state untouched.
#[derive(Debug, Default)]
pub struct StateDelta {
    pub sub_queries: Option<Vec<String>>,
    pub web_results: Option<Vec<SubQueryResults>>,
    pub crawl_decisions: Option<Vec<CrawlDecision>>,
    pub enriched_results: Option<Vec<WebSearchResult>>,
    pub grundsatz_results: Option<SearchOutcome>,
    pub aggregated_results: Option<Vec<AggregatedSource>>,
    /// Shallow-merged by key.
    pub categorized_sources: Option<HashMap<String, Vec<String>>>,
    pub reference_map: Option<ReferenceMap>,
    pub citations: Option<Vec<CitationMarker>>,
    pub citation_sources: Option<Vec<Reference>>,
    pub summary: Option<Summary>,
    pub dossier: Option<String>,
    /// Always appended, never replaced.
    pub errors: Vec<String>,
}

impl StateDelta {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Self::default()
        }
    }
}

/// Apply a node's delta. Scalar = replace, map = shallow-merge, list =
/// replace; `errors` appends.
pub fn apply_delta(state: &mut ResearchState, delta: StateDelta) {
    if let Some(v) = delta.sub_queries {
        state.sub_queries = v;
    }
    if let Some(v) = delta.web_results {
        state.web_results = v;
    }
    if let Some(v) = delta.crawl_decisions {
        state.crawl_decisions = v;
    }
    if let Some(v) = delta.enriched_results {
        state.enriched_results = v;
    }
    if let Some(v) = delta.grundsatz_results {
        state.grundsatz_results = Some(v);
    }
    if let Some(v) = delta.aggregated_results {
        state.aggregated_results = v;
    }
    if let Some(map) = delta.categorized_sources {
        for (key, value) in map {
            state.categorized_sources.insert(key, value);
        }
    }
    if let Some(v) = delta.reference_map {
        state.reference_map = v;
    }
    if let Some(v) = delta.citations {
        state.citations = v;
    }
    if let Some(v) = delta.citation_sources {
        state.citation_sources = v;
    }
    if let Some(v) = delta.summary {
        state.summary = Some(v);
    }
    if let Some(v) = delta.dossier {
        state.dossier = Some(v);
    }
    state.errors.extend(delta.errors);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_append_while_lists_replace() {
        let mut state = ResearchState::new("Testfrage", ResearchMode::Normal);
        state.sub_queries = vec!["alt".into()];
        state.errors.push("erster Fehler".into());

        let delta = StateDelta {
            sub_queries: Some(vec!["neu".into()]),
            errors: vec!["zweiter Fehler".into()],
            ..StateDelta::default()
        };
        apply_delta(&mut state, delta);

        assert_eq!(state.sub_queries, vec!["neu".to_string()]);
        assert_eq!(state.errors.len(), 2);
    }

    #[test]
    fn maps_shallow_merge() {
        let mut state = ResearchState::new("Testfrage", ResearchMode::Deep);
        state
            .categorized_sources
            .insert("news".into(), vec!["https://a.example".into()]);

        let mut update = HashMap::new();
        update.insert("grundsatz".to_string(), vec!["Programm".to_string()]);
        apply_delta(
            &mut state,
            StateDelta {
                categorized_sources: Some(update),
                ..StateDelta::default()
            },
        );

        assert_eq!(state.categorized_sources.len(), 2);
        assert!(state.categorized_sources.contains_key("news"));
    }

    #[test]
    fn none_fields_leave_state_untouched() {
        let mut state = ResearchState::new("Testfrage", ResearchMode::Normal);
        state.summary = Some(Summary {
            text: "bleibt".into(),
            generated: true,
        });
        apply_delta(&mut state, StateDelta::default());
        assert_eq!(state.summary.as_ref().unwrap().text, "bleibt");
    }
}
