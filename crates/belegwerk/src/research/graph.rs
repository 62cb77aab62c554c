//! The staged research state machine: planner → search → crawl decision →
//! enrichment → aggregation → drafting, with per-node error isolation and
//! caller-driven cancellation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::nodes::{
    aggregate_node, crawl_decision_node, crawl_limit, enrich_node, grundsatz_node,
    web_search_node,
};
use super::planner::{fallback_plan, optimize_query, plan_deep};
use super::state::{
    apply_delta, AggregatedSource, ResearchMode, ResearchState, StateDelta, SubQueryResults,
    Summary,
};
use super::summarize::{dossier_node, summarize_node};
use crate::config::ResearchConfig;
use crate::crawler::PageFetcher;
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::retrieve::{HybridRetriever, SearchOutcome};
use crate::types::{CitationMarker, Reference, WebSearchResult, GRUNDSATZ_OWNER};
use crate::websearch::{SearchOptions, SearchProvider};

#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub query: String,
    pub mode: ResearchMode,
    pub user_id: String,
    pub search_options: Option<SearchOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub errors: Vec<String>,
    pub sub_query_count: usize,
    pub crawled_count: usize,
    pub duration_ms: u64,
    /// Set when some branch failed but usable output remains.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalSearchOutput {
    pub status: String,
    pub query: String,
    pub results: Vec<WebSearchResult>,
    pub summary: Summary,
    pub citations: Vec<CitationMarker>,
    pub citation_sources: Vec<Reference>,
    pub metadata: RunMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResearchOutput {
    pub status: String,
    pub dossier: Option<String>,
    pub research_questions: Vec<String>,
    pub search_results: Vec<SubQueryResults>,
    pub sources: Vec<AggregatedSource>,
    pub categorized_sources: HashMap<String, Vec<String>>,
    pub grundsatz_results: Option<SearchOutcome>,
    pub citations: Vec<CitationMarker>,
    pub citation_sources: Vec<Reference>,
    pub metadata: RunMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResearchOutput {
    Normal(NormalSearchOutput),
    Deep(Box<DeepResearchOutput>),
}

pub struct ResearchGraph {
    websearch: Arc<dyn SearchProvider>,
    crawler: Arc<dyn PageFetcher>,
    llm: Arc<dyn LanguageModel>,
    retriever: Arc<HybridRetriever>,
    config: ResearchConfig,
    grundsatz_collection: String,
    default_language: String,
    default_max_results: usize,
}

impl ResearchGraph {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        websearch: Arc<dyn SearchProvider>,
        crawler: Arc<dyn PageFetcher>,
        llm: Arc<dyn LanguageModel>,
        retriever: Arc<HybridRetriever>,
        config: ResearchConfig,
        grundsatz_collection: String,
        default_language: String,
        default_max_results: usize,
    ) -> Self {
        Self {
            websearch,
            crawler,
            llm,
            retriever,
            config,
            grundsatz_collection,
            default_language,
            default_max_results,
        }
    }

    pub async fn run(
        &self,
        request: &ResearchRequest,
        cancel: CancellationToken,
    ) -> Result<ResearchOutput> {
        if request.query.trim().is_empty() {
            return Err(Error::InvalidInput("empty query".into()));
        }
        if request.user_id.trim().is_empty() {
            return Err(Error::InvalidInput("missing user id".into()));
        }

        let started = Instant::now();
        let mut state = ResearchState::new(&request.query, request.mode);
        let search_options = request
            .search_options
            .clone()
            .unwrap_or_else(|| SearchOptions::general(&self.default_language, self.default_max_results));

        // Planner. The only node whose total failure aborts the run.
        let planner_delta = match request.mode {
            ResearchMode::Normal => StateDelta {
                sub_queries: Some(vec![optimize_query(&request.query)]),
                ..StateDelta::default()
            },
            ResearchMode::Deep => plan_deep(&self.llm, &request.query).await,
        };
        apply_delta(&mut state, planner_delta);
        if state.sub_queries.is_empty() {
            apply_delta(&mut state, fallback_plan(&request.query));
        }
        if state.sub_queries.is_empty() {
            return Err(Error::Permanent("planner produced no queries".into()));
        }
        self.checkpoint(&cancel)?;

        match request.mode {
            ResearchMode::Normal => {
                let delta = self
                    .search_chain(&state, &search_options, false, &cancel)
                    .await?;
                apply_delta(&mut state, delta);
                self.checkpoint(&cancel)?;

                let delta = summarize_node(&state, &self.llm, self.config.summary_max_chars).await;
                apply_delta(&mut state, delta);

                Ok(ResearchOutput::Normal(self.normal_output(state, started)))
            }
            ResearchMode::Deep => {
                // Web-search chain and grundsatz search have no data
                // dependency; run them concurrently on state snapshots.
                let (chain_delta, grundsatz_delta) = tokio::join!(
                    self.search_chain(&state, &search_options, true, &cancel),
                    grundsatz_node(
                        &state,
                        &self.retriever,
                        &self.grundsatz_collection,
                        GRUNDSATZ_OWNER,
                    ),
                );
                apply_delta(&mut state, chain_delta?);
                apply_delta(&mut state, grundsatz_delta);
                self.checkpoint(&cancel)?;

                let aggregate_delta = aggregate_node(&state);
                apply_delta(&mut state, aggregate_delta);
                self.checkpoint(&cancel)?;

                let delta = dossier_node(&state, &self.llm, &self.config).await;
                apply_delta(&mut state, delta);

                Ok(ResearchOutput::Deep(Box::new(
                    self.deep_output(state, started),
                )))
            }
        }
    }

    /// search → crawl decision → enrichment, run on a snapshot so the deep
    /// mode can overlap it with the grundsatz branch.
    async fn search_chain(
        &self,
        state: &ResearchState,
        options: &SearchOptions,
        deep: bool,
        cancel: &CancellationToken,
    ) -> Result<StateDelta> {
        let mut local = state.clone();
        let inherited_errors = local.errors.len();

        let delta = web_search_node(
            &local,
            &self.websearch,
            options,
            self.config.search_concurrency,
        )
        .await;
        apply_delta(&mut local, delta);
        self.checkpoint(cancel)?;

        let limit = crawl_limit(&self.config, deep);
        let delta = crawl_decision_node(&local, &self.llm, limit).await;
        apply_delta(&mut local, delta);
        self.checkpoint(cancel)?;

        let timeout = Duration::from_secs(if deep {
            self.config.deep_crawl_timeout_secs
        } else {
            self.config.normal_crawl_timeout_secs
        });
        let delta = enrich_node(&local, &self.crawler, timeout, self.config.crawl_content_cap).await;
        apply_delta(&mut local, delta);

        Ok(StateDelta {
            web_results: Some(local.web_results),
            crawl_decisions: Some(local.crawl_decisions),
            enriched_results: Some(local.enriched_results),
            errors: local.errors.split_off(inherited_errors),
            ..StateDelta::default()
        })
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            // Partial state is dropped with the run.
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn normal_output(&self, state: ResearchState, started: Instant) -> NormalSearchOutput {
        let summary = state.summary.clone().unwrap_or(Summary {
            text: String::new(),
            generated: false,
        });
        let has_artefact = !summary.text.is_empty() || !state.enriched_results.is_empty();

        NormalSearchOutput {
            status: if has_artefact { "success" } else { "error" }.to_string(),
            query: state.query.clone(),
            metadata: self.metadata(&state, started),
            results: state.enriched_results,
            summary,
            citations: state.citations,
            citation_sources: state.citation_sources,
        }
    }

    fn deep_output(&self, state: ResearchState, started: Instant) -> DeepResearchOutput {
        let has_artefact = state.dossier.is_some() || !state.aggregated_results.is_empty();

        DeepResearchOutput {
            status: if has_artefact { "success" } else { "error" }.to_string(),
            metadata: self.metadata(&state, started),
            dossier: state.dossier,
            research_questions: state.sub_queries,
            search_results: state.web_results,
            sources: state.aggregated_results,
            categorized_sources: state.categorized_sources,
            grundsatz_results: state.grundsatz_results,
            citations: state.citations,
            citation_sources: state.citation_sources,
        }
    }

    fn metadata(&self, state: &ResearchState, started: Instant) -> RunMetadata {
        let crawled_count = state
            .enriched_results
            .iter()
            .filter(|r| r.content.is_some())
            .count();
        RunMetadata {
            partial: !state.errors.is_empty(),
            errors: state.errors.clone(),
            sub_query_count: state.sub_queries.len(),
            crawled_count,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{CrawlOptions, CrawlResult};
    use crate::embeddings::testing::HashedEmbeddings;
    use crate::llm::testing::ScriptedModel;
    use crate::storage::{TextIndex, VectorStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Returns five deterministic hits for every query; URLs are shared
    /// across queries so aggregation has duplicates to collapse.
    struct ScriptedSearch;

    #[async_trait]
    impl SearchProvider for ScriptedSearch {
        async fn search(
            &self,
            query: &str,
            _options: &SearchOptions,
        ) -> Result<Vec<WebSearchResult>> {
            Ok((0..5)
                .map(|rank| WebSearchResult {
                    rank,
                    title: format!("Quelle {rank}"),
                    url: format!("https://quelle{rank}.example/artikel"),
                    snippet: format!("Ausschnitt {rank} zu {query}"),
                    content: None,
                    domain: format!("quelle{rank}.example"),
                    engine: "test".into(),
                    score: 1.0 - rank as f32 * 0.1,
                    published_date: None,
                    category: "general".into(),
                })
                .collect())
        }
    }

    struct ScriptedFetcher;

    #[async_trait]
    impl crate::crawler::PageFetcher for ScriptedFetcher {
        async fn crawl(&self, url: &str, _options: &CrawlOptions) -> CrawlResult {
            let mut result = CrawlResult::failure(url, 200, String::new());
            result.success = true;
            result.error = None;
            result.title = "Gecrawlte Seite".into();
            result.markdown =
                "## Abschnitt\n\nAusführlicher Inhalt über Klimaschutz und Verkehrswende.\n\n\
                 Weitere Details zur kommunalen Umsetzung."
                    .into();
            result.content = result.markdown.clone();
            result.word_count = result.content.split_whitespace().count();
            result.char_count = result.content.chars().count();
            result
        }
    }

    async fn test_graph(
        config: &crate::config::EngineConfig,
        dir: &TempDir,
        llm: Arc<dyn LanguageModel>,
    ) -> ResearchGraph {
        crate::test_logging::init();
        let path = dir.path().to_str().unwrap();
        let vectors = Arc::new(VectorStore::new(path, 8).await.expect("vector store"));
        vectors
            .ensure_collection(&config.search.grundsatz_collection, &[])
            .await
            .expect("grundsatz collection");
        let retriever = Arc::new(HybridRetriever::new(
            vectors,
            Arc::new(TextIndex::new(path).expect("text index")),
            Arc::new(HashedEmbeddings::new(8)),
            config.search.clone(),
        ));
        ResearchGraph::new(
            Arc::new(ScriptedSearch),
            Arc::new(ScriptedFetcher),
            llm,
            retriever,
            config.research.clone(),
            config.search.grundsatz_collection.clone(),
            config.web_search.default_language.clone(),
            config.web_search.max_results,
        )
    }

    #[tokio::test]
    async fn normal_search_produces_cited_summary() {
        let config = crate::config::EngineConfig::default();
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![
            // crawl decision
            r#"[{"index": 0, "reason": "amtliche Quelle", "value": "high"},
                {"index": 1, "reason": "aktueller Bericht", "value": "medium"}]"#,
            // summary
            "Freiburg fördert kommunalen Klimaschutz [1]. Die Maßnahmen zeigen Wirkung [2].",
        ]));
        let graph = test_graph(&config, &dir, llm).await;

        let request = ResearchRequest {
            query: "Kommunaler Klimaschutz Freiburg".into(),
            mode: ResearchMode::Normal,
            user_id: "u1".into(),
            search_options: None,
        };
        let output = graph.run(&request, CancellationToken::new()).await.unwrap();

        let ResearchOutput::Normal(output) = output else {
            panic!("expected normal output");
        };
        assert_eq!(output.status, "success");
        assert_eq!(output.results.len(), 5);
        // The two decided URLs carry crawled content, the rest stay snippets.
        assert_eq!(
            output.results.iter().filter(|r| r.content.is_some()).count(),
            2
        );
        assert!(output.summary.generated);
        assert!(output.summary.text.chars().count() <= 800);
        assert!(output.citations.len() >= 2);
        for citation in &output.citations {
            assert!(output
                .citation_sources
                .iter()
                .any(|source| source.id == citation.reference_id));
        }
    }

    #[tokio::test]
    async fn deep_research_builds_dossier_with_methodology() {
        let config = crate::config::EngineConfig::default();
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![
            // planner
            r#"["Hintergrund der Verkehrswende?", "Aktuelle Projekte?",
                "Auswirkungen auf Pendler?", "Gegenargumente?", "Ausblick 2030?"]"#,
            // crawl decision
            r#"[{"index": 0, "reason": "Studie", "value": "high"}]"#,
            // dossier
            "## Hintergrund\n\nDie Verkehrswende in mittelgroßen Städten schreitet voran [1]. \
             Weitere Untersuchungen stützen das [2].",
        ]));
        let graph = test_graph(&config, &dir, llm).await;

        let request = ResearchRequest {
            query: "Verkehrswende in mittelgroßen Städten".into(),
            mode: ResearchMode::Deep,
            user_id: "u1".into(),
            search_options: None,
        };
        let output = graph.run(&request, CancellationToken::new()).await.unwrap();

        let ResearchOutput::Deep(output) = output else {
            panic!("expected deep output");
        };
        assert_eq!(output.status, "success");
        assert_eq!(output.research_questions.len(), 5);
        assert!(!output.sources.is_empty());
        // Shared URLs across sub-queries collapse to five sources.
        assert_eq!(output.sources.len(), 5);
        assert!(output.sources.iter().any(|s| s.sub_queries.len() == 5));

        let dossier = output.dossier.as_deref().expect("dossier present");
        assert!(dossier.contains("## Methodik"));
        let grundsatz_count = output
            .grundsatz_results
            .as_ref()
            .map(|g| g.results.len())
            .unwrap_or(0);
        assert!(dossier.contains(&format!("{} Teilfragen", output.research_questions.len())));
        assert!(dossier.contains(&format!("{} externe Quellen", output.sources.len())));
        assert!(dossier.contains(&format!("{} Grundsatzdokumente", grundsatz_count)));
    }

    #[tokio::test]
    async fn output_status_tracks_artefacts() {
        let config = crate::config::EngineConfig::default();
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec!["{}"]));
        let graph = test_graph(&config, &dir, llm).await;

        // No sources, no summary → error status.
        let state = ResearchState::new("Frage", ResearchMode::Normal);
        let output = graph.normal_output(state, Instant::now());
        assert_eq!(output.status, "error");

        let mut with_summary = ResearchState::new("Frage", ResearchMode::Normal);
        with_summary.summary = Some(Summary {
            text: "Belegte Antwort [1].".into(),
            generated: true,
        });
        let output = graph.normal_output(with_summary, Instant::now());
        assert_eq!(output.status, "success");
    }

    #[tokio::test]
    async fn cancellation_is_a_distinct_outcome() {
        let config = crate::config::EngineConfig::default();
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec!["{}"]));
        let graph = test_graph(&config, &dir, llm).await;

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(graph.checkpoint(&token), Err(Error::Cancelled)));

        let request = ResearchRequest {
            query: "Verkehrswende".into(),
            mode: ResearchMode::Normal,
            user_id: "u1".into(),
            search_options: None,
        };
        let outcome = graph.run(&request, token).await;
        assert!(matches!(outcome, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn empty_query_is_invalid_input() {
        let config = crate::config::EngineConfig::default();
        let dir = TempDir::new().unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec!["{}"]));
        let graph = test_graph(&config, &dir, llm).await;

        let request = ResearchRequest {
            query: "   ".into(),
            mode: ResearchMode::Deep,
            user_id: "u1".into(),
            search_options: None,
        };
        let outcome = graph.run(&request, CancellationToken::new()).await;
        assert!(matches!(outcome, Err(Error::InvalidInput(_))));
    }
}
