//! The traffic model: sites, their pages and the tags those pages fire.
//!
//! A model is a JSON object keyed by site id:
//!
//! ```json
//! { "s1": { "weight": 1.0,
//!           "pages": { "100": { "weight": 0.5, "tags": [1, 2] } } } }
//! ```
//!
//! Site weights are a categorical distribution and must sum to one. Page
//! weights are independent selection probabilities. Validation happens once,
//! at load, so a broken model is reported at startup and never mid-run.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use tracing::{error, info};

use crate::{Error, ValidationError, weighted};

/// Identifier of a site
pub type SiteId = String;
/// Identifier of a page, string-encoded in the model
pub type PageId = u64;
/// Identifier of a tag
pub type TagId = u64;

/// A page of a site
#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PageConfig {
    /// Probability that this page is selected when its site is drawn
    pub weight: f64,
    /// Tags fired whenever this page is selected
    #[serde(default)]
    pub tags: BTreeSet<TagId>,
}

/// A site and its pages
#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    /// Share of all draws that select this site
    pub weight: f64,
    /// Pages of this site, keyed by page id
    #[serde(default)]
    pub pages: BTreeMap<PageId, PageConfig>,
}

/// A traffic model
///
/// Models built through [`TrafficModel::from_slice`],
/// [`TrafficModel::from_path`] or [`TrafficModel::load`] are validated. Sites
/// iterate in key order. This order fixes the cumulative bounds of the site
/// distribution and so makes draws reproducible for a given seed.
#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq)]
#[serde(transparent)]
pub struct TrafficModel {
    sites: BTreeMap<SiteId, SiteConfig>,
}

/// Where to load a traffic model from
#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum ModelSource {
    /// Read the model from a file
    Path(PathBuf),
    /// The model JSON itself
    Inline(String),
}

impl TrafficModel {
    /// Parse and validate a model from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if `raw` is not a model document and
    /// [`Error::InvalidConfiguration`] if the model violates an invariant.
    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        let model: Self = serde_json::from_slice(raw).map_err(Error::Parse)?;
        model.validate()?;
        Ok(model)
    }

    /// Read, parse and validate a model file.
    ///
    /// # Errors
    ///
    /// As [`TrafficModel::from_slice`], plus [`Error::Read`] if the file
    /// cannot be read.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let raw = fs::read(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&raw)
    }

    /// Load a model from `source`, logging fatally on failure.
    ///
    /// # Errors
    ///
    /// See [`TrafficModel::from_path`].
    pub fn load(source: &ModelSource) -> Result<Self, Error> {
        let res = match source {
            ModelSource::Path(path) => Self::from_path(path),
            ModelSource::Inline(raw) => Self::from_slice(raw.as_bytes()),
        };
        match res {
            Ok(model) => {
                info!(
                    sites = model.sites.len(),
                    pages = model.total_pages(),
                    "loaded traffic model"
                );
                Ok(model)
            }
            Err(err) => {
                error!("Problem loading traffic model from {source:?}: {err}");
                Err(err)
            }
        }
    }

    /// Check every structural invariant of the model.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sites.is_empty() {
            return Err(ValidationError::EmptyModel);
        }
        let mut sum = 0.0;
        for (site, config) in &self.sites {
            if !weighted::is_probability(config.weight) {
                return Err(ValidationError::SiteWeight {
                    site: site.clone(),
                    weight: config.weight,
                });
            }
            sum += config.weight;
            for (page, page_config) in &config.pages {
                if !weighted::is_probability(page_config.weight) {
                    return Err(ValidationError::PageWeight {
                        site: site.clone(),
                        page: *page,
                        weight: page_config.weight,
                    });
                }
            }
        }
        if (sum - 1.0_f64).abs() > weighted::WEIGHT_SUM_TOLERANCE {
            return Err(ValidationError::WeightSum { sum });
        }
        Ok(())
    }

    /// Sites of this model in key order.
    pub fn sites(&self) -> impl Iterator<Item = (&SiteId, &SiteConfig)> {
        self.sites.iter()
    }

    /// Look up a single site.
    #[must_use]
    pub fn site(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.get(id)
    }

    fn total_pages(&self) -> usize {
        self.sites.values().map(|s| s.pages.len()).sum()
    }
}

impl FromStr for TrafficModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(s.as_bytes())
    }
}
