//! Error taxonomy — spec.md §7.
//!
//! Each variant maps to a named failure mode from the spec's error-handling
//! design; propagation rules live with their call sites (the pipeline driver
//! degrades Tier C/D failures instead of propagating them, for instance).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MatchEngineError>;

#[derive(Debug, Error)]
pub enum MatchEngineError {
    /// Input empty/too short after cleaning — spec.md §4.1.
    #[error("normalisation failed: {0}")]
    Normalisation(String),

    /// Relational store transport failure, retried before surfacing here.
    #[error("relational store lookup failed: {0}")]
    Lookup(String),

    /// Embedding service call failed; Tier C degrades rather than aborting.
    #[error("embedding service error: {0}")]
    Embedding(String),

    /// Vector store call failed; Tier C degrades rather than aborting.
    #[error("vector store error: {0}")]
    Vector(String),

    /// Spatial refinement failed; Tier D is skipped, Tier B candidates retained.
    #[error("spatial refinement error: {0}")]
    Spatial(String),

    /// No candidate met any threshold, or all were filtered out.
    #[error("no candidate met any decision threshold")]
    DecisionConflict,

    /// Final upsert failed — fatal for the document, not the run.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Fatal for the run.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<rusqlite::Error> for MatchEngineError {
    fn from(e: rusqlite::Error) -> Self {
        MatchEngineError::Lookup(e.to_string())
    }
}
