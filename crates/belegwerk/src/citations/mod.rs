//! Reference maps and `[n]` citation validation.
//!
//! A reference map is built once per drafting call; its numbering is never
//! changed after the model has seen it. Validation removes markers that point
//! outside the map and reports them, and is idempotent.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use crate::types::{CitationMarker, Reference};

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("citation marker regex is valid"));

/// Candidate source before numbering.
#[derive(Debug, Clone)]
pub struct ReferenceCandidate {
    pub title: String,
    pub snippets: Vec<String>,
    pub url: Option<String>,
    pub source_kind: String,
    pub similarity_score: Option<f32>,
    pub chunk_index: Option<u32>,
    /// Dedup/diversity key: document id for chunks, URL for web sources.
    pub group_key: String,
    /// Primary sources (full content, grundsatz documents) are numbered
    /// before supplementary snippets.
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct ReferenceLimits {
    pub per_group: usize,
    pub max_total: usize,
}

impl Default for ReferenceLimits {
    fn default() -> Self {
        Self {
            per_group: 4,
            max_total: 12,
        }
    }
}

/// `numeric_id → Reference`, ids ascending from 1 with no gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceMap {
    references: BTreeMap<u32, Reference>,
}

impl ReferenceMap {
    pub fn get(&self, id: u32) -> Option<&Reference> {
        self.references.get(&id)
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Reference)> {
        self.references.iter()
    }

    pub fn references(&self) -> Vec<Reference> {
        self.references.values().cloned().collect()
    }
}

/// Dedupe by URL, diversify per group, cap the total, then assign ascending
/// ids with primary sources first.
pub fn build_reference_map(
    candidates: &[ReferenceCandidate],
    limits: &ReferenceLimits,
) -> ReferenceMap {
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut per_group: BTreeMap<String, usize> = BTreeMap::new();
    let mut selected: Vec<&ReferenceCandidate> = Vec::new();

    // Two passes keep primary sources ahead of supplementary ones without
    // re-sorting, which would disturb within-class ordering.
    for pass_primary in [true, false] {
        for candidate in candidates {
            if candidate.primary != pass_primary {
                continue;
            }
            if selected.len() >= limits.max_total {
                break;
            }
            if let Some(ref url) = candidate.url {
                if !seen_urls.insert(url.clone()) {
                    continue;
                }
            }
            let group_count = per_group.entry(candidate.group_key.clone()).or_insert(0);
            if *group_count >= limits.per_group {
                continue;
            }
            *group_count += 1;
            selected.push(candidate);
        }
    }

    let mut references = BTreeMap::new();
    for (i, candidate) in selected.into_iter().enumerate() {
        let id = (i + 1) as u32;
        references.insert(
            id,
            Reference {
                id,
                title: candidate.title.clone(),
                snippets: candidate.snippets.clone(),
                url: candidate.url.clone(),
                source_kind: candidate.source_kind.clone(),
                similarity_score: candidate.similarity_score,
                chunk_index: candidate.chunk_index,
            },
        );
    }

    ReferenceMap { references }
}

/// Compact textual listing the model is instructed to cite from.
pub fn summarize_references_for_prompt(map: &ReferenceMap) -> String {
    let mut out = String::new();
    for (id, reference) in map.iter() {
        out.push_str(&format!("[{}] {}", id, reference.title));
        if let Some(ref url) = reference.url {
            out.push_str(&format!(" — {}", url));
        }
        out.push('\n');
        for snippet in reference.snippets.iter().take(2) {
            let preview: String = snippet.chars().take(200).collect();
            out.push_str(&format!("    {}\n", preview.trim()));
        }
    }
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatedDraft {
    pub clean_draft: String,
    /// Markers in order of appearance, duplicates included.
    pub citations: Vec<CitationMarker>,
    /// Unique references actually cited, ascending by id.
    pub sources: Vec<Reference>,
    pub errors: Vec<String>,
}

/// Validate `[n]` markers against the map. Unknown markers are removed from
/// the draft and reported; known ones are kept as-is, so applying the
/// function twice yields the same draft.
pub fn validate_and_inject(draft: &str, map: &ReferenceMap) -> ValidatedDraft {
    let mut citations = Vec::new();
    let mut cited_ids: Vec<u32> = Vec::new();
    let mut errors = Vec::new();

    let clean_draft = MARKER_RE.replace_all(draft, |caps: &regex::Captures<'_>| {
        let id: u32 = caps[1].parse().unwrap_or(0);
        if map.get(id).is_some() {
            citations.push(CitationMarker {
                marker_id: id,
                reference_id: id,
            });
            if !cited_ids.contains(&id) {
                cited_ids.push(id);
            }
            caps[0].to_string()
        } else {
            errors.push(format!("marker [{id}] has no reference"));
            String::new()
        }
    });

    // Removing a marker can leave "word ." or doubled spaces behind.
    let clean_draft = tidy_after_removal(&clean_draft);

    cited_ids.sort_unstable();
    let sources = cited_ids
        .into_iter()
        .filter_map(|id| map.get(id).cloned())
        .collect();

    ValidatedDraft {
        clean_draft,
        citations,
        sources,
        errors,
    }
}

fn tidy_after_removal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ' ' {
            // Collapse runs of spaces and drop a space directly before
            // sentence punctuation.
            while chars.peek() == Some(&' ') {
                chars.next();
            }
            if matches!(chars.peek(), Some('.') | Some(',') | Some(';') | Some(':')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, url: Option<&str>, group: &str, primary: bool) -> ReferenceCandidate {
        ReferenceCandidate {
            title: title.to_string(),
            snippets: vec![format!("Auszug aus {title}")],
            url: url.map(String::from),
            source_kind: "web".to_string(),
            similarity_score: None,
            chunk_index: None,
            group_key: group.to_string(),
            primary,
        }
    }

    #[test]
    fn reference_ids_are_contiguous_from_one() {
        let candidates = vec![
            candidate("A", Some("https://a.example"), "a", false),
            candidate("B", Some("https://b.example"), "b", true),
            candidate("C", Some("https://c.example"), "c", false),
        ];
        let map = build_reference_map(&candidates, &ReferenceLimits::default());
        let ids: Vec<u32> = map.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // Primary source numbered first
        assert_eq!(map.get(1).unwrap().title, "B");
    }

    #[test]
    fn duplicate_urls_are_deduped_and_groups_capped() {
        let candidates = vec![
            candidate("A", Some("https://same.example"), "g1", false),
            candidate("A again", Some("https://same.example"), "g1", false),
            candidate("B", Some("https://b1.example"), "g2", false),
            candidate("B2", Some("https://b2.example"), "g2", false),
            candidate("B3", Some("https://b3.example"), "g2", false),
        ];
        let limits = ReferenceLimits {
            per_group: 2,
            max_total: 10,
        };
        let map = build_reference_map(&candidates, &limits);
        assert_eq!(map.len(), 3); // A, B, B2 — URL dupe and group overflow dropped
    }

    #[test]
    fn validate_removes_unknown_markers_and_reports_them() {
        let candidates = vec![
            candidate("Eins", Some("https://1.example"), "1", false),
            candidate("Zwei", Some("https://2.example"), "2", false),
        ];
        let map = build_reference_map(&candidates, &ReferenceLimits::default());

        let result = validate_and_inject("A [1]. B [9]. C [2].", &map);
        assert_eq!(result.clean_draft, "A [1]. B. C [2].");
        assert_eq!(
            result.citations,
            vec![
                CitationMarker { marker_id: 1, reference_id: 1 },
                CitationMarker { marker_id: 2, reference_id: 2 },
            ]
        );
        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("[9]"));
    }

    #[test]
    fn validate_is_idempotent() {
        let map = build_reference_map(
            &[candidate("Eins", Some("https://1.example"), "1", false)],
            &ReferenceLimits::default(),
        );
        let once = validate_and_inject("Fakt[1]. Unbelegt [7], mehr Text.", &map);
        let twice = validate_and_inject(&once.clean_draft, &map);
        assert_eq!(once.clean_draft, twice.clean_draft);
        assert!(twice.errors.is_empty());
    }

    #[test]
    fn zero_marker_draft_passes_through() {
        let map = ReferenceMap::default();
        let result = validate_and_inject("Ein Absatz ohne Belege.", &map);
        assert_eq!(result.clean_draft, "Ein Absatz ohne Belege.");
        assert!(result.citations.is_empty());
        assert!(result.sources.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn glued_and_repeated_markers_are_handled() {
        let map = build_reference_map(
            &[
                candidate("Eins", Some("https://1.example"), "1", false),
                candidate("Zwei", Some("https://2.example"), "2", false),
            ],
            &ReferenceLimits::default(),
        );
        let result = validate_and_inject("Fakt[1].[2] Nochmal[1][2].", &map);
        assert_eq!(result.citations.len(), 4);
        assert_eq!(result.sources.len(), 2);
        assert!(result.errors.is_empty());
        assert_eq!(result.clean_draft, "Fakt[1].[2] Nochmal[1][2].");
    }
}
