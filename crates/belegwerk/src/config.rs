use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub crawler: CrawlerConfig,
    pub web_search: WebSearchConfig,
    pub research: ResearchConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub preserve_structure: bool,
    /// Documents with at most this many chunks are reconstructed in full
    /// instead of searched.
    pub full_text_chunk_threshold: usize,
    /// PDF pages beyond this are not extracted.
    pub max_pdf_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub candidate_multiplier: usize,
    pub rrf_k: usize,
    pub vector_weight: f32,
    pub text_weight: f32,
    /// Dynamic threshold: results below `top_score * relative_gap` are cut.
    pub relative_gap: f32,
    /// Absolute floor for the dynamic threshold.
    pub score_floor: f32,
    /// Collection holding user document chunks.
    pub chunks_collection: String,
    /// Collection holding curated official (grundsatz) documents.
    pub grundsatz_collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub timeout_secs: u64,
    pub max_content_bytes: usize,
    pub user_agent: String,
    /// Refuse loopback and private-range targets when set.
    pub production: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub default_language: String,
    pub cache_ttl_secs: u64,
    pub news_cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub max_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// In-flight meta-search calls across sub-queries.
    pub search_concurrency: usize,
    pub normal_crawl_limit: usize,
    pub deep_crawl_limit: usize,
    pub normal_crawl_timeout_secs: u64,
    pub deep_crawl_timeout_secs: u64,
    pub crawl_content_cap: usize,
    pub summary_max_chars: usize,
    pub dossier_limit_per_doc: usize,
    pub dossier_max_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub key_file: PathBuf,
    pub key_backup_file: PathBuf,
}

impl EngineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.embedding.batch_size == 0 {
            return Err("embedding.batch_size must be > 0".into());
        }
        if self.chunking.max_tokens < 16 {
            return Err("chunking.max_tokens must be >= 16".into());
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err("chunking.overlap_tokens must be < max_tokens".into());
        }
        if self.search.default_limit == 0 {
            return Err("search.default_limit must be > 0".into());
        }
        let weight_sum = self.search.vector_weight + self.search.text_weight;
        if !(0.99..=1.01).contains(&weight_sum) {
            return Err("search.vector_weight + search.text_weight must sum to 1.0".into());
        }
        if self.research.normal_crawl_limit == 0 || self.research.deep_crawl_limit == 0 {
            return Err("research crawl limits must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("belegwerk");

        Self {
            security: SecurityConfig {
                key_file: data_dir.join("master.key"),
                key_backup_file: data_dir.join("master.key.enc"),
            },
            embedding: EmbeddingConfig {
                endpoint: "http://localhost:8080/v1/embeddings".to_string(),
                model: "multilingual-e5-base".to_string(),
                dimension: 768,
                batch_size: 10,
                max_retries: 3,
            },
            chunking: ChunkingConfig {
                max_tokens: 400,
                overlap_tokens: 50,
                preserve_structure: true,
                full_text_chunk_threshold: 13,
                max_pdf_pages: 1000,
            },
            search: SearchConfig {
                default_limit: 10,
                candidate_multiplier: 3,
                rrf_k: 60,
                vector_weight: 0.7,
                text_weight: 0.3,
                relative_gap: 0.55,
                score_floor: 0.25,
                chunks_collection: "chunks".to_string(),
                grundsatz_collection: "grundsatz".to_string(),
            },
            crawler: CrawlerConfig {
                timeout_secs: 10,
                max_content_bytes: 2 * 1024 * 1024,
                user_agent: "belegwerk/0.1".to_string(),
                production: true,
            },
            web_search: WebSearchConfig {
                endpoint: "http://localhost:8888/search".to_string(),
                timeout_secs: 10,
                default_language: "de".to_string(),
                cache_ttl_secs: 3600,
                news_cache_ttl_secs: 900,
                cache_capacity: 1000,
                max_results: 10,
            },
            research: ResearchConfig {
                search_concurrency: 8,
                normal_crawl_limit: 2,
                deep_crawl_limit: 5,
                normal_crawl_timeout_secs: 3,
                deep_crawl_timeout_secs: 5,
                crawl_content_cap: 20_000,
                summary_max_chars: 800,
                dossier_limit_per_doc: 4,
                dossier_max_total: 12,
            },
            data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_overlap_not_below_max() {
        let mut config = EngineConfig::default();
        config.chunking.overlap_tokens = config.chunking.max_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unbalanced_fusion_weights() {
        let mut config = EngineConfig::default();
        config.search.vector_weight = 0.9;
        assert!(config.validate().is_err());
    }
}
