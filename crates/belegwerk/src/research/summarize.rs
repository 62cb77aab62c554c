//! Drafting nodes: the normal-mode summarizer and the deep-mode dossier
//! writer, both citation-validated.

use std::sync::Arc;

use super::state::{ResearchState, StateDelta, Summary};
use crate::citations::{
    build_reference_map, summarize_references_for_prompt, validate_and_inject,
    ReferenceCandidate, ReferenceLimits, ReferenceMap,
};
use crate::config::ResearchConfig;
use crate::llm::{LanguageModel, LlmMessage, LlmOptions, LlmRequest};

/// Paragraph budget when condensing a crawled page for the prompt.
const PARAGRAPH_CHAR_CAP: usize = 400;
const SUMMARY_FULL_SOURCES: usize = 3;
const SUMMARY_SNIPPET_SOURCES: usize = 5;

/// Rank paragraphs by term overlap with the query and keep the best, each
/// truncated to the paragraph budget. Deterministic: ties keep document
/// order.
pub fn extract_relevant_paragraphs(content: &str, query: &str, take: usize) -> Vec<String> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(String::from)
        .collect();

    let mut scored: Vec<(usize, usize, &str)> = content
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| p.split_whitespace().count() >= 5)
        .enumerate()
        .map(|(position, paragraph)| {
            let lowered = paragraph.to_lowercase();
            let overlap = terms
                .iter()
                .map(|term| lowered.matches(term.as_str()).count())
                .sum();
            (overlap, position, paragraph)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    scored
        .into_iter()
        .take(take)
        .map(|(_, _, paragraph)| truncate_chars(paragraph, PARAGRAPH_CHAR_CAP))
        .collect()
}

/// Normal-mode summarizer: top full-content sources plus snippet sources,
/// a strict length cap, and validated citations.
pub async fn summarize_node(
    state: &ResearchState,
    llm: &Arc<dyn LanguageModel>,
    max_chars: usize,
) -> StateDelta {
    let full_sources: Vec<_> = state
        .enriched_results
        .iter()
        .filter(|r| r.content.is_some())
        .take(SUMMARY_FULL_SOURCES)
        .collect();
    let snippet_sources: Vec<_> = state
        .enriched_results
        .iter()
        .filter(|r| r.content.is_none())
        .take(SUMMARY_SNIPPET_SOURCES)
        .collect();

    if full_sources.is_empty() && snippet_sources.is_empty() {
        return StateDelta::error("no sources to summarize");
    }

    let mut candidates = Vec::new();
    for result in &full_sources {
        let content = result.content.as_deref().unwrap_or_default();
        candidates.push(ReferenceCandidate {
            title: result.title.clone(),
            snippets: extract_relevant_paragraphs(content, &state.query, 2),
            url: Some(result.url.clone()),
            source_kind: "web_full".to_string(),
            similarity_score: None,
            chunk_index: None,
            group_key: result.domain.clone(),
            primary: true,
        });
    }
    for result in &snippet_sources {
        candidates.push(ReferenceCandidate {
            title: result.title.clone(),
            snippets: vec![truncate_chars(&result.snippet, PARAGRAPH_CHAR_CAP)],
            url: Some(result.url.clone()),
            source_kind: "web_snippet".to_string(),
            similarity_score: None,
            chunk_index: None,
            group_key: result.domain.clone(),
            primary: false,
        });
    }

    let limits = ReferenceLimits {
        per_group: 2,
        max_total: SUMMARY_FULL_SOURCES + SUMMARY_SNIPPET_SOURCES,
    };
    let reference_map = build_reference_map(&candidates, &limits);

    let prompt = format!(
        "Fasse die Rechercheergebnisse zu folgender Frage zusammen:\n{}\n\n\
         Quellen:\n{}\n\
         Regeln: höchstens {max_chars} Zeichen, deutsche Sprache, jede Kernaussage mit \
         [n]-Verweis auf eine der nummerierten Quellen belegen. Keine Quellen erfinden.",
        state.query,
        summarize_references_for_prompt(&reference_map),
    );

    let request = LlmRequest {
        request_type: "summarize".to_string(),
        system_prompt: Some(
            "Du schreibst knappe, belegte Zusammenfassungen für politische Recherchen.".into(),
        ),
        messages: vec![LlmMessage::user(prompt)],
        options: LlmOptions {
            max_tokens: 512,
            temperature: 0.3,
            tools: None,
        },
    };

    match llm.process(request).await {
        Ok(response) if response.text().is_some() => {
            let draft = truncate_chars(response.text().unwrap_or_default(), max_chars);
            let validated = validate_and_inject(&draft, &reference_map);
            StateDelta {
                reference_map: Some(reference_map),
                citations: Some(validated.citations),
                citation_sources: Some(validated.sources),
                summary: Some(Summary {
                    text: validated.clean_draft,
                    generated: true,
                }),
                errors: validated.errors,
                ..StateDelta::default()
            }
        }
        outcome => {
            let reason = match outcome {
                Ok(response) => response.error.unwrap_or_else(|| "empty reply".into()),
                Err(e) => e.to_string(),
            };
            tracing::warn!(error = %reason, "summary generation failed, using snippets");
            let fallback = fallback_summary(state, max_chars);
            StateDelta {
                reference_map: Some(reference_map),
                summary: Some(fallback),
                errors: vec![format!("summary generation failed: {reason}")],
                ..StateDelta::default()
            }
        }
    }
}

fn fallback_summary(state: &ResearchState, max_chars: usize) -> Summary {
    let text = state
        .enriched_results
        .iter()
        .take(3)
        .map(|r| format!("{}: {}", r.title, r.snippet))
        .collect::<Vec<_>>()
        .join(" — ");
    Summary {
        text: truncate_chars(&text, max_chars),
        generated: false,
    }
}

/// Deep-mode dossier writer: diversified reference map, sectioned long-form
/// draft, validated citations, deterministic methodology appendix.
pub async fn dossier_node(
    state: &ResearchState,
    llm: &Arc<dyn LanguageModel>,
    config: &ResearchConfig,
) -> StateDelta {
    let mut candidates = Vec::new();

    if let Some(ref grundsatz) = state.grundsatz_results {
        for chunk in &grundsatz.results {
            candidates.push(ReferenceCandidate {
                title: if chunk.title.is_empty() {
                    "Grundsatzdokument".to_string()
                } else {
                    chunk.title.clone()
                },
                snippets: vec![truncate_chars(&chunk.chunk_text, PARAGRAPH_CHAR_CAP)],
                url: None,
                source_kind: "grundsatz".to_string(),
                similarity_score: Some(chunk.similarity_score),
                chunk_index: Some(chunk.chunk_index),
                group_key: chunk.document_id.clone(),
                primary: true,
            });
        }
    }

    for source in &state.aggregated_results {
        let has_content = source.content.is_some();
        let snippets = match source.content.as_deref() {
            Some(content) => extract_relevant_paragraphs(content, &state.query, 2),
            None => vec![truncate_chars(&source.snippet, PARAGRAPH_CHAR_CAP)],
        };
        candidates.push(ReferenceCandidate {
            title: source.title.clone(),
            snippets,
            url: Some(source.url.clone()),
            source_kind: if has_content { "web_full" } else { "web_snippet" }.to_string(),
            similarity_score: None,
            chunk_index: None,
            group_key: source.domain.clone(),
            primary: has_content,
        });
    }

    if candidates.is_empty() {
        return StateDelta::error("no sources for dossier");
    }

    let limits = ReferenceLimits {
        per_group: config.dossier_limit_per_doc,
        max_total: config.dossier_max_total,
    };
    let reference_map = build_reference_map(&candidates, &limits);
    let methodology = methodology_section(state);

    let prompt = format!(
        "Erstelle ein ausführliches Recherche-Dossier zu:\n{}\n\n\
         Teilfragen:\n{}\n\nQuellen:\n{}\n\
         Struktur: Markdown mit den Abschnitten ## Hintergrund, ## Aktuelle Entwicklungen, \
         ## Auswirkungen, ## Kontroversen und Perspektiven, ## Fazit. Jede Kernaussage mit \
         [n]-Verweis belegen. Keine Quellen erfinden, keinen Methodik-Abschnitt schreiben.",
        state.query,
        state
            .sub_queries
            .iter()
            .map(|q| format!("- {q}"))
            .collect::<Vec<_>>()
            .join("\n"),
        summarize_references_for_prompt(&reference_map),
    );

    let request = LlmRequest {
        request_type: "write_dossier".to_string(),
        system_prompt: Some(
            "Du schreibst fundierte, quellengestützte Dossiers für politische Arbeit.".into(),
        ),
        messages: vec![LlmMessage::user(prompt)],
        options: LlmOptions {
            max_tokens: 3000,
            temperature: 0.4,
            tools: None,
        },
    };

    match llm.process(request).await {
        Ok(response) if response.text().is_some() => {
            let validated = validate_and_inject(response.text().unwrap_or_default(), &reference_map);
            let dossier = format!("{}\n\n{}", validated.clean_draft.trim_end(), methodology);
            StateDelta {
                reference_map: Some(reference_map),
                citations: Some(validated.citations),
                citation_sources: Some(validated.sources),
                dossier: Some(dossier),
                errors: validated.errors,
                ..StateDelta::default()
            }
        }
        outcome => {
            let reason = match outcome {
                Ok(response) => response.error.unwrap_or_else(|| "empty reply".into()),
                Err(e) => e.to_string(),
            };
            tracing::warn!(error = %reason, "dossier generation failed, using source digest");
            let digest = fallback_dossier(state, &reference_map, &methodology);
            StateDelta {
                reference_map: Some(reference_map),
                dossier: Some(digest),
                errors: vec![format!("dossier generation failed: {reason}")],
                ..StateDelta::default()
            }
        }
    }
}

/// The methodology counts must equal the actual source counts, so this is
/// computed from the state, never from the model.
fn methodology_section(state: &ResearchState) -> String {
    let grundsatz_count = state
        .grundsatz_results
        .as_ref()
        .map(|g| g.results.len())
        .unwrap_or(0);
    let crawled = state
        .aggregated_results
        .iter()
        .filter(|s| s.content.is_some())
        .count();

    format!(
        "## Methodik\n\nFür dieses Dossier wurden {} Teilfragen recherchiert. \
         Ausgewertet wurden {} externe Quellen, davon {} im Volltext, sowie {} \
         Grundsatzdokumente.",
        state.sub_queries.len(),
        state.aggregated_results.len(),
        crawled,
        grundsatz_count,
    )
}

fn fallback_dossier(
    state: &ResearchState,
    reference_map: &ReferenceMap,
    methodology: &str,
) -> String {
    let mut out = format!("## Quellenübersicht: {}\n\n", state.query);
    for (id, reference) in reference_map.iter() {
        out.push_str(&format!("[{}] {}", id, reference.title));
        if let Some(ref url) = reference.url {
            out.push_str(&format!(" — {url}"));
        }
        out.push('\n');
    }
    out.push('\n');
    out.push_str(methodology);
    out
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        text.chars().take(cap).collect()
    }
}
