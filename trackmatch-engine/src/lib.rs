//! # Trackmatch Engine
//!
//! Retrieval-and-fusion engine for audio provenance identification:
//! determines which original recording (if any) a distorted or derived
//! clip was produced from.
//!
//! The engine consumes decoded PCM and opaque embedding vectors; the
//! embedding model, audio decoding and any API surface are external
//! collaborators. Core pieces:
//!
//! - [`cache`]: content-addressed embedding cache
//! - [`index`]: vector index (flat / HNSW / IVF) with sidecar metadata
//! - [`services`]: segmentation, parallel query execution, evidence
//!   fusion, transform-aware policy, ingestion, incremental updates
//! - [`engine`]: the [`MatchEngine`] facade wiring it all together

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod models;
pub mod services;
pub mod utils;

pub use engine::MatchEngine;
pub use error::{EngineError, Result};
