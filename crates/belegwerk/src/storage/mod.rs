pub mod documents;
pub mod text_index;
pub mod vector_store;

pub use documents::DocumentStore;
pub use text_index::TextIndex;
pub use vector_store::{ChunkHit, PayloadIndex, PayloadIndexKind, VectorStore};
