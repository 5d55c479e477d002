//! Engine data model
//!
//! Immutable value types flowing through the retrieval pipeline.

pub mod candidate;
pub mod query;
pub mod results;
pub mod segment;

pub use candidate::AggregatedCandidate;
pub use query::{
    AudioBuffer, QueryMetadata, QueryRequest, QueryResponse, Severity, TransformHint,
    TransformKind,
};
pub use results::{SegmentHit, SegmentQueryResult};
pub use segment::{file_id_from_segment_key, segment_key, validate_file_id, Segment};
