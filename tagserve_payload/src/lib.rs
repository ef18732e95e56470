//! The tagserve payloads
//!
//! This library draws synthetic tag request metrics from a declarative traffic
//! model -- sites, the pages of each site and the tags fired by each page --
//! and marshals every draw into a message ready for a downstream broker.

#![deny(clippy::cargo)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use rand::Rng;

pub mod generator;
pub mod marshal;
pub mod model;
pub mod weighted;

pub use generator::{LazyGenerator, Sample, SampleGenerator, State, TagFires, TimeWindow};
pub use marshal::{JsonMarshaller, Marshal, TagRequest};
pub use model::{ModelSource, PageConfig, PageId, SiteConfig, SiteId, TagId, TrafficModel};

/// Errors related to loading a traffic model and producing messages from it
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The traffic model text is not valid JSON for the model schema
    #[error("Traffic model could not be parsed: {0}")]
    Parse(#[source] serde_json::Error),
    /// The traffic model file could not be read
    #[error("Failed to read traffic model {path:?}: {source}")]
    Read {
        /// Model path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The traffic model parsed but violates a structural invariant
    #[error("Invalid traffic model: {0}")]
    InvalidConfiguration(#[from] ValidationError),
    /// A draw failed against a validated model. Indicates a validation bug.
    #[error("Sampling failed against a validated model: {0}")]
    Sampling(String),
    /// Json payload could not be encoded
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    /// The one-time generator initialization failed. Every caller receives
    /// the same underlying error.
    #[error("Generator initialization failed: {0}")]
    Initialization(Arc<Error>),
}

/// Structural invariant violations in a traffic model
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The model declares no sites
    #[error("Traffic model declares no sites")]
    EmptyModel,
    /// A site weight is not a probability
    #[error("Site {site} has weight {weight}, must be within [0, 1]")]
    SiteWeight {
        /// Offending site
        site: SiteId,
        /// Offending weight
        weight: f64,
    },
    /// A page weight is not a probability
    #[error("Page {page} of site {site} has weight {weight}, must be within [0, 1]")]
    PageWeight {
        /// Site owning the page
        site: SiteId,
        /// Offending page
        page: PageId,
        /// Offending weight
        weight: f64,
    },
    /// Category weights do not sum to unity
    #[error("Weights must sum to unity, sum is {sum}")]
    WeightSum {
        /// The accumulated sum
        sum: f64,
    },
    /// No category carries positive weight
    #[error("No category carries positive weight")]
    NoCategories,
    /// A category weight is not a probability
    #[error("Category weight {weight} must be within [0, 1]")]
    CategoryWeight {
        /// Offending weight
        weight: f64,
    },
}

/// To serialize into bytes
pub trait Serialize {
    /// Write bytes into writer, subject to `max_bytes` limitations.
    ///
    /// # Errors
    ///
    /// Implementations draw and marshal messages; errors come from either
    /// step or from the writer.
    fn to_bytes<W, R>(&mut self, rng: R, max_bytes: usize, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + Sized,
        W: Write;
}

/// Generate instances of `Self::Output` from source of randomness.
pub trait Generator<'a> {
    /// The generated type
    type Output: 'a;
    /// The error produced when generation fails
    type Error: 'a;

    /// Generate a new instance of `Self::Output`.
    ///
    /// # Errors
    ///
    /// See implementation.
    fn generate<R>(&'a self, rng: &mut R) -> Result<Self::Output, Self::Error>
    where
        R: rand::Rng + ?Sized;
}
