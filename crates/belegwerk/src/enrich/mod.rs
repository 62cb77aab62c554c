//! Request enrichment: turn one user message plus its selections into
//! grounding context for prompt assembly. Four branches — URL crawls,
//! selected documents, saved texts, web search — run in parallel and degrade
//! independently.

use futures::StreamExt;
use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::crawler::{CrawlOptions, Crawler};
use crate::error::Result;
use crate::llm::{LanguageModel, LlmMessage, LlmOptions, LlmRequest};
use crate::retrieve::{HybridRetriever, RetrieveOptions};
use crate::storage::DocumentStore;
use crate::types::{DocumentRef, WebSearchResult};
use crate::websearch::{MetaSearchClient, SearchOptions};

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("url regex is valid")
});

const MAX_DETECTED_URLS: usize = 3;
const URL_CRAWL_TIMEOUT: Duration = Duration::from_secs(15);
const LARGE_DOC_CHUNK_LIMIT: usize = 5;
const WEB_SOURCE_DISPLAY_LIMIT: usize = 10;
/// Rough character budget for the ~1000-token web summary.
const WEB_SUMMARY_CHAR_BUDGET: usize = 4000;
/// Reading-speed heuristic for the page estimate in document headers.
const WORDS_PER_PAGE: usize = 300;

#[derive(Debug, Clone, Default)]
pub struct EnrichRequest {
    pub owner_id: String,
    pub message: String,
    pub attachments: Vec<String>,
    /// URLs already attached as documents; detected duplicates are skipped.
    pub attached_urls: Vec<String>,
    pub document_ids: Vec<Uuid>,
    pub saved_text_ids: Vec<Uuid>,
    pub web_search: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichedContext {
    pub documents: Vec<DocumentRef>,
    pub knowledge: Vec<String>,
    pub web_sources: Vec<WebSearchResult>,
    pub tool_instructions: Vec<String>,
    pub errors: Vec<String>,
}

pub struct RequestEnricher {
    crawler: Arc<Crawler>,
    retriever: Arc<HybridRetriever>,
    documents: Arc<DocumentStore>,
    websearch: Arc<MetaSearchClient>,
    llm: Arc<dyn LanguageModel>,
    chunking: ChunkingConfig,
    language: String,
}

impl RequestEnricher {
    pub fn new(
        crawler: Arc<Crawler>,
        retriever: Arc<HybridRetriever>,
        documents: Arc<DocumentStore>,
        websearch: Arc<MetaSearchClient>,
        llm: Arc<dyn LanguageModel>,
        chunking: ChunkingConfig,
        language: String,
    ) -> Self {
        Self {
            crawler,
            retriever,
            documents,
            websearch,
            llm,
            chunking,
            language,
        }
    }

    pub async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichedContext> {
        if request.owner_id.trim().is_empty() {
            return Err(crate::error::Error::InvalidInput("missing owner".into()));
        }

        let (url_branch, docs_branch, saved_branch, web_branch) = tokio::join!(
            self.crawl_detected_urls(request),
            self.selected_documents(request),
            self.saved_texts(request),
            self.web_branch(request),
        );

        let mut context = EnrichedContext::default();

        let (crawled, mut errors) = url_branch;
        context.documents.extend(crawled);
        context.errors.append(&mut errors);

        let (documents, mut errors) = docs_branch;
        context.documents.extend(documents);
        context.errors.append(&mut errors);

        let (knowledge, mut errors) = saved_branch;
        context.knowledge.extend(knowledge);
        context.errors.append(&mut errors);

        let (summary, sources, mut errors) = web_branch;
        if let Some(summary) = summary {
            context.knowledge.push(summary);
        }
        context.web_sources = sources;
        context.errors.append(&mut errors);

        if !context.documents.is_empty() {
            context.tool_instructions.push(
                "Stütze deine Antwort auf die beigefügten Dokumentauszüge und zitiere sie."
                    .to_string(),
            );
        }
        if !context.web_sources.is_empty() {
            context.tool_instructions.push(
                "Aktuelle Webquellen sind beigefügt; kennzeichne daraus übernommene Aussagen."
                    .to_string(),
            );
        }

        Ok(context)
    }

    /// Branch 1: URLs in the message body and attachments, capped, deduped
    /// against already-attached documents, crawled with a generous timeout.
    async fn crawl_detected_urls(
        &self,
        request: &EnrichRequest,
    ) -> (Vec<DocumentRef>, Vec<String>) {
        let mut haystack = request.message.clone();
        for attachment in &request.attachments {
            haystack.push('\n');
            haystack.push_str(attachment);
        }

        let urls = detect_urls(&haystack, &request.attached_urls, MAX_DETECTED_URLS);
        if urls.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let crawls = urls.into_iter().map(|url| {
            let crawler = Arc::clone(&self.crawler);
            async move {
                let options = CrawlOptions {
                    timeout: Some(URL_CRAWL_TIMEOUT),
                    max_content_chars: Some(30_000),
                    enhanced_metadata: false,
                };
                let result = crawler.crawl(&url, &options).await;
                (url, result)
            }
        });

        let results: Vec<_> = futures::stream::iter(crawls)
            .buffer_unordered(MAX_DETECTED_URLS)
            .collect()
            .await;

        let mut documents = Vec::new();
        let mut errors = Vec::new();
        for (url, result) in results {
            if result.success {
                documents.push(DocumentRef::CrawledPage {
                    url: result.final_url,
                    title: if result.title.is_empty() {
                        url
                    } else {
                        result.title
                    },
                    markdown: result.markdown,
                    word_count: result.word_count,
                });
            } else {
                errors.push(format!(
                    "URL {url} konnte nicht geladen werden: {}",
                    result.error.unwrap_or_else(|| "unbekannt".into())
                ));
            }
        }
        (documents, errors)
    }

    /// Branch 2: selected documents, partitioned by size. Small documents are
    /// included in full; large ones contribute their best chunks.
    async fn selected_documents(
        &self,
        request: &EnrichRequest,
    ) -> (Vec<DocumentRef>, Vec<String>) {
        let mut documents = Vec::new();
        let mut errors = Vec::new();

        let mut large_ids: Vec<String> = Vec::new();
        for id in &request.document_ids {
            let doc_id = id.to_string();
            match self.retriever.chunk_count(&request.owner_id, &doc_id).await {
                Ok(count) if count == 0 => {
                    errors.push(format!("Dokument {id} hat keine indexierten Inhalte"));
                }
                Ok(count) if count <= self.chunking.full_text_chunk_threshold => {
                    match self
                        .retriever
                        .full_document_text(&request.owner_id, &doc_id)
                        .await
                    {
                        Ok((text, chunk_count)) => {
                            let title = self.document_title(&request.owner_id, *id).await;
                            documents.push(DocumentRef::FullText {
                                doc_id,
                                title,
                                text,
                                chunk_count,
                            });
                        }
                        Err(e) => errors.push(format!("Dokument {id}: {e}")),
                    }
                }
                Ok(_) => large_ids.push(doc_id),
                Err(e) => errors.push(format!("Dokument {id}: {e}")),
            }
        }

        if !large_ids.is_empty() {
            let options = RetrieveOptions::scoped(LARGE_DOC_CHUNK_LIMIT, large_ids);
            match self
                .retriever
                .search(&request.message, &request.owner_id, &options)
                .await
            {
                Ok(outcome) => {
                    for chunk in outcome.results {
                        documents.push(DocumentRef::Chunk {
                            doc_id: chunk.document_id,
                            chunk_index: chunk.chunk_index,
                            text: chunk.chunk_text,
                            title: chunk.title,
                            score: chunk.similarity_score,
                        });
                    }
                }
                Err(e) => errors.push(format!("Dokumentsuche fehlgeschlagen: {e}")),
            }
        }

        (documents, errors)
    }

    async fn document_title(&self, owner_id: &str, id: Uuid) -> String {
        self.documents
            .get(owner_id, id)
            .await
            .map(|d| d.title)
            .unwrap_or_else(|_| id.to_string())
    }

    /// Branch 3: saved texts from the relational store, formatted.
    async fn saved_texts(&self, request: &EnrichRequest) -> (Vec<String>, Vec<String>) {
        let mut knowledge = Vec::new();
        let mut errors = Vec::new();

        for id in &request.saved_text_ids {
            match self.documents.get(&request.owner_id, *id).await {
                Ok(record) => {
                    match self
                        .retriever
                        .full_document_text(&request.owner_id, &id.to_string())
                        .await
                    {
                        Ok((text, _)) => {
                            knowledge.push(format_grounding_block(
                                &record.title,
                                record.filename.as_deref(),
                                &text,
                                "gespeicherter Text",
                            ));
                        }
                        Err(e) => errors.push(format!("Text {id}: {e}")),
                    }
                }
                Err(e) => errors.push(format!("Text {id}: {e}")),
            }
        }

        (knowledge, errors)
    }

    /// Branch 4: one general web search plus a bounded model summary; the top
    /// sources are kept for UI display.
    async fn web_branch(
        &self,
        request: &EnrichRequest,
    ) -> (Option<String>, Vec<WebSearchResult>, Vec<String>) {
        if !request.web_search {
            return (None, Vec::new(), Vec::new());
        }

        let options = SearchOptions::general(&self.language, WEB_SOURCE_DISPLAY_LIMIT);
        let results = match self.websearch.search(&request.message, &options).await {
            Ok(results) => results,
            Err(e) => {
                return (
                    None,
                    Vec::new(),
                    vec![format!("Websuche fehlgeschlagen: {e}")],
                )
            }
        };
        if results.is_empty() {
            return (None, Vec::new(), Vec::new());
        }

        let listing = results
            .iter()
            .take(WEB_SOURCE_DISPLAY_LIMIT)
            .map(|r| format!("- {}: {}", r.title, r.snippet))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Fasse die folgenden Suchtreffer zu \"{}\" in wenigen Sätzen zusammen:\n{listing}",
            request.message
        );

        let summary = match self
            .llm
            .process(LlmRequest {
                request_type: "web_summary".to_string(),
                system_prompt: None,
                messages: vec![LlmMessage::user(prompt)],
                options: LlmOptions {
                    max_tokens: 1000,
                    temperature: 0.3,
                    tools: None,
                },
            })
            .await
        {
            Ok(response) => response.text().map(|text| {
                let bounded: String = text.chars().take(WEB_SUMMARY_CHAR_BUDGET).collect();
                format!("Websuche: {bounded}")
            }),
            Err(e) => {
                tracing::debug!(error = %e, "web summary failed, sources only");
                None
            }
        };

        let sources = results
            .into_iter()
            .take(WEB_SOURCE_DISPLAY_LIMIT)
            .collect();
        (summary, sources, Vec::new())
    }
}

/// Find http(s) URLs, skip those already attached, keep first-seen order,
/// cap the count.
pub fn detect_urls(text: &str, attached: &[String], cap: usize) -> Vec<String> {
    let mut seen: Vec<String> = attached.to_vec();
    let mut urls = Vec::new();

    for found in URL_RE.find_iter(text) {
        let url = found
            .as_str()
            .trim_end_matches(['.', ',', ';', ':', '!', '?'])
            .to_string();
        if seen.iter().any(|existing| *existing == url) {
            continue;
        }
        seen.push(url.clone());
        urls.push(url);
        if urls.len() >= cap {
            break;
        }
    }
    urls
}

/// Consistent grounding block: header metadata, then the body.
pub fn format_grounding_block(
    title: &str,
    filename: Option<&str>,
    text: &str,
    content_tag: &str,
) -> String {
    let word_count = text.split_whitespace().count();
    let page_estimate = word_count.div_ceil(WORDS_PER_PAGE).max(1);
    let mut header = format!("### {title} [{content_tag}]");
    if let Some(filename) = filename {
        header.push_str(&format!("\nDatei: {filename}"));
    }
    header.push_str(&format!(
        "\nUmfang: ca. {page_estimate} Seiten, {word_count} Wörter\n\n"
    ));
    header + text
}
