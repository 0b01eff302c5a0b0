//! Crate-wide error type.
//!
//! Degenerate inputs (empty particle sets, zero groups at a level) are not
//! errors: the affected phase returns an empty result and the pipeline keeps
//! going. Errors are reserved for states the caller must fix (bad
//! configuration) or cannot recover from (worker desync).

use thiserror::Error;

/// Top-level error type for the halo_finder crate.
#[derive(Error, Debug)]
pub enum FinderError {
  /// A configuration value is missing or inconsistent. The pipeline does
  /// not start.
  #[error("configuration error: {key}: {message}")]
  Config {
    /// The offending option key.
    key: &'static str,
    /// What was wrong with it.
    message: String,
  },

  /// A worker failed to report during a collective phase of the
  /// distributed search.
  #[error("distributed desync: {0}")]
  Distributed(String),

  /// A scratch allocation exceeded its configured cap. The labels from the
  /// last committed phase are retained.
  #[error("resource exhaustion: {0}")]
  Resource(String),
}

impl FinderError {
  pub fn config(key: &'static str, message: impl Into<String>) -> Self {
    Self::Config {
      key,
      message: message.into(),
    }
  }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FinderError>;
