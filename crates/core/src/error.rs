//! Error types shared across the trader crates.

use crate::types::DecisionBundle;
use thiserror::Error;

/// Construction-time configuration failures. These are the only errors that
/// prevent a trader from being created.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Initial balance must be supplied and positive.
    #[error("initial balance must be greater than zero, got {0}")]
    MissingInitialBalance(f64),

    /// Venue name is not one of the supported exchanges.
    #[error("unsupported venue: {0}")]
    UnsupportedVenue(String),

    /// A scheduling interval was zero.
    #[error("invalid interval for {name}: must be greater than zero")]
    InvalidInterval {
        /// Name of the offending setting.
        name: &'static str,
    },

    /// Figment could not read or deserialize the configuration.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Decision source failure. Carries whatever partial output the source
/// produced (prompts, chain of thought, raw decisions) so it can be persisted.
#[derive(Debug, Error)]
#[error("decision source failed: {source}")]
pub struct DecisionSourceError {
    /// Partial bundle returned before the failure.
    pub partial: Option<DecisionBundle>,
    /// Underlying cause.
    #[source]
    pub source: anyhow::Error,
}

impl DecisionSourceError {
    #[must_use]
    pub fn new(source: anyhow::Error) -> Self {
        Self {
            partial: None,
            source,
        }
    }

    #[must_use]
    pub fn with_partial(source: anyhow::Error, partial: DecisionBundle) -> Self {
        Self {
            partial: Some(partial),
            source,
        }
    }
}

impl From<anyhow::Error> for DecisionSourceError {
    fn from(source: anyhow::Error) -> Self {
        Self::new(source)
    }
}
