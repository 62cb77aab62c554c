pub mod graph;
pub mod nodes;
pub mod planner;
pub mod state;
pub mod summarize;

pub use graph::{
    DeepResearchOutput, NormalSearchOutput, ResearchGraph, ResearchOutput, ResearchRequest,
    RunMetadata,
};
pub use state::{AggregatedSource, ResearchMode, ResearchState, SubQueryResults, Summary};
