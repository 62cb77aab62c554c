pub mod chunker;
pub mod extractor;
pub mod pdf;

pub use chunker::{chunk_text, count_tokens, Chunk, ChunkOptions};
pub use extractor::{ExtractedText, ExtractionMethod, ExtractionStats, TextExtractor};
pub use pdf::OcrEngine;
