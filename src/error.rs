//! Pipeline error taxonomy.
//!
//! Provider failures abort a single bot-response attempt; conflict errors
//! are retried once against the store's uniqueness constraints before
//! surfacing. Channel transport and session failures never become errors at
//! this level: adapters log them and report an absent send, and the
//! session state machine absorbs socket loss itself. Nothing here
//! terminates the process.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// LLM call failure, including missing or invalid credentials.
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    /// Concurrent writers hit a uniqueness constraint and the retry also
    /// lost.
    #[error("conflict while persisting {0}")]
    Conflict(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
