//! Query planning: synonym-expanded single query in normal mode, LLM-planned
//! sub-questions with a deterministic fallback in deep mode.

use std::sync::Arc;

use super::state::StateDelta;
use crate::llm::{strip_json_fences, LanguageModel, LlmMessage, LlmOptions, LlmRequest};

const MAX_QUERY_CHARS: usize = 400;

/// Domain synonym table. Keys are matched as whole lowercase words; the
/// expansion terms are appended once.
const SYNONYMS: [(&str, &[&str]); 9] = [
    ("klimaschutz", &["klimapolitik"]),
    ("verkehrswende", &["mobilitätswende"]),
    ("radverkehr", &["fahrradinfrastruktur"]),
    ("öpnv", &["nahverkehr", "öffentlicher verkehr"]),
    ("wohnungsbau", &["wohnraum"]),
    ("energiewende", &["erneuerbare energien"]),
    ("digitalisierung", &["verwaltungsdigitalisierung"]),
    ("housing", &["affordable housing"]),
    ("transit", &["public transport"]),
];

/// Expand the query with domain synonyms and cap its length. Deterministic.
pub fn optimize_query(query: &str) -> String {
    let query = query.trim();
    let lowered = query.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();

    let mut expanded = query.to_string();
    for (term, synonyms) in SYNONYMS {
        if words.iter().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == term) {
            for synonym in synonyms {
                if !lowered.contains(synonym) {
                    expanded.push(' ');
                    expanded.push_str(synonym);
                }
            }
        }
    }

    if expanded.chars().count() > MAX_QUERY_CHARS {
        expanded.chars().take(MAX_QUERY_CHARS).collect()
    } else {
        expanded
    }
}

/// Deep-mode planning: ask the model for 4–5 strategic sub-questions; fall
/// back to the deterministic expansion template when the reply does not
/// parse.
pub async fn plan_deep(llm: &Arc<dyn LanguageModel>, query: &str) -> StateDelta {
    let prompt = format!(
        "Zerlege die Forschungsfrage in 4 bis 5 strategische Teilfragen, die zusammen \
         Hintergrund, aktuelle Entwicklungen, Auswirkungen, Gegenpositionen und Ausblick \
         abdecken.\n\nForschungsfrage: {query}\n\n\
         Antworte NUR mit einem JSON-Array von Strings."
    );

    let request = LlmRequest {
        request_type: "plan_research".to_string(),
        system_prompt: Some(
            "Du bist ein Rechercheplaner. Antworte ausschließlich mit validem JSON.".to_string(),
        ),
        messages: vec![LlmMessage::user(prompt)],
        options: LlmOptions {
            max_tokens: 512,
            temperature: 0.4,
            tools: None,
        },
    };

    match llm.process(request).await {
        Ok(response) => {
            if let Some(content) = response.text() {
                if let Some(questions) = parse_questions(content) {
                    return StateDelta {
                        sub_queries: Some(questions),
                        ..StateDelta::default()
                    };
                }
            }
            let mut delta = fallback_plan(query);
            delta.errors.push("planner reply did not parse, using template".into());
            delta
        }
        Err(e) => {
            tracing::warn!(error = %e, "deep planner LLM call failed");
            let mut delta = fallback_plan(query);
            delta.errors.push(format!("planner unavailable: {e}"));
            delta
        }
    }
}

fn parse_questions(raw: &str) -> Option<Vec<String>> {
    let cleaned = strip_json_fences(raw);
    let parsed: Vec<String> = serde_json::from_str(cleaned).ok()?;
    let questions: Vec<String> = parsed
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .take(5)
        .collect();
    (questions.len() >= 4).then_some(questions)
}

/// Deterministic expansion covering the five research angles.
pub fn fallback_plan(query: &str) -> StateDelta {
    let query = optimize_query(query);
    StateDelta {
        sub_queries: Some(vec![
            format!("{query} Hintergrund und Ausgangslage"),
            format!("{query} aktuelle Entwicklungen"),
            format!("{query} Auswirkungen und Folgen"),
            format!("{query} Kritik und alternative Positionen"),
            format!("{query} Ausblick und Perspektiven"),
        ]),
        ..StateDelta::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingModel, ScriptedModel};
    use crate::llm::LanguageModel;

    #[test]
    fn synonyms_expand_whole_words_only() {
        let expanded = optimize_query("Verkehrswende in Freiburg");
        assert!(expanded.contains("mobilitätswende"));

        // Substrings must not trigger
        let untouched = optimize_query("Radverkehrswende");
        assert_eq!(untouched, "Radverkehrswende");
    }

    #[test]
    fn expansion_is_idempotent_when_synonym_already_present() {
        let expanded = optimize_query("Klimaschutz und Klimapolitik");
        assert_eq!(expanded.matches("limapolitik").count(), 1);
    }

    #[test]
    fn query_length_is_capped() {
        let long = "Klimaschutz ".repeat(60);
        assert!(optimize_query(&long).chars().count() <= MAX_QUERY_CHARS);
    }

    #[tokio::test]
    async fn deep_plan_parses_model_reply() {
        let model: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![
            r#"["Frage eins?", "Frage zwei?", "Frage drei?", "Frage vier?", "Frage fünf?"]"#,
        ]));
        let delta = plan_deep(&model, "Verkehrswende in mittelgroßen Städten").await;
        let questions = delta.sub_queries.unwrap();
        assert_eq!(questions.len(), 5);
        assert!(delta.errors.is_empty());
    }

    #[tokio::test]
    async fn deep_plan_falls_back_on_garbage() {
        let model: Arc<dyn LanguageModel> =
            Arc::new(ScriptedModel::new(vec!["keine Liste, nur Prosa"]));
        let delta = plan_deep(&model, "Wärmeplanung").await;
        let questions = delta.sub_queries.unwrap();
        assert_eq!(questions.len(), 5);
        assert!(!delta.errors.is_empty());
    }

    #[tokio::test]
    async fn deep_plan_survives_model_outage() {
        let model: Arc<dyn LanguageModel> = Arc::new(FailingModel);
        let delta = plan_deep(&model, "Wärmeplanung").await;
        assert_eq!(delta.sub_queries.unwrap().len(), 5);
        assert_eq!(delta.errors.len(), 1);
    }
}
