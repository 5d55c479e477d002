//! Engine services
//!
//! One module per pipeline stage: segmentation, embedding seam, parallel
//! query execution, evidence fusion, re-ranking, search policy, ingestion
//! and incremental index updates.

pub mod aggregator;
pub mod embedder;
pub mod index_updater;
pub mod ingest;
pub mod query_executor;
pub mod reranker;
pub mod search_policy;
pub mod segmenter;

pub use aggregator::Aggregator;
pub use embedder::EmbeddingProvider;
pub use index_updater::{merge_into_index, MergeReport};
pub use ingest::{FileEmbeddings, IngestItem, Ingestor};
pub use query_executor::{EarlyStopDecision, QueryExecutor};
pub use search_policy::{estimate_recall_at_5, SearchPolicy};
pub use segmenter::{AudioSegment, Segmenter};
