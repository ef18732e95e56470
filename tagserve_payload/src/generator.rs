//! Nested weighted draws over a traffic model.
//!
//! Each draw composes three levels of choice:
//!
//! * a site, drawn from the categorical distribution of site weights,
//! * the pages of that site, each included by an independent Bernoulli trial
//!   against its own weight,
//! * the union of the tags of every included page, each fired exactly once.
//!
//! The draw is stamped with a short time window anchored at generation time.
//! [`SampleGenerator`] is immutable once built and safe to share between
//! threads; randomness is supplied by the caller so that every worker may keep
//! its own source. [`LazyGenerator`] defers loading the model until first use
//! and guarantees the load happens exactly once.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_tuple::{Deserialize_tuple, Serialize_tuple};
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::{
    Error, Generator,
    model::{ModelSource, PageId, SiteId, TagId, TrafficModel},
    weighted,
};

/// Default width of a sample's time window, in milliseconds.
pub const DEFAULT_WINDOW_MILLIS: u64 = 30;

/// Default `window_millis` for serde.
#[must_use]
pub fn default_window_millis() -> u64 {
    DEFAULT_WINDOW_MILLIS
}

/// Half-open interval `[start, end)` in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start
    pub start: u64,
    /// Exclusive end
    pub end: u64,
}

/// Fire counts recorded for a single tag
///
/// Encoded as the triple `[fires, secondary, tertiary]`. Only `fires` is
/// computed by this generator, the remaining counters are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct TagFires {
    /// Number of times the tag fired
    pub fires: u32,
    /// Secondary counter, not computed
    pub secondary: u32,
    /// Tertiary counter, not computed
    pub tertiary: u32,
}

impl TagFires {
    /// A tag that fired once.
    pub const ONCE: Self = Self {
        fires: 1,
        secondary: 0,
        tertiary: 0,
    };
}

/// A single draw from the traffic model
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<'a> {
    /// The drawn site
    pub site_id: &'a str,
    /// The time window of this draw
    pub time_window: TimeWindow,
    /// Pages selected in this draw, a subset of the site's pages
    pub page_ids: BTreeSet<PageId>,
    /// Every tag of every selected page, each fired once
    pub tag_fire_counts: BTreeMap<TagId, TagFires>,
}

#[derive(Debug)]
struct Page {
    id: PageId,
    weight: f64,
    tags: Vec<TagId>,
}

#[derive(Debug)]
struct Site {
    id: SiteId,
    pages: Vec<Page>,
}

/// Draws [`Sample`] instances from a validated [`TrafficModel`]
#[derive(Debug)]
pub struct SampleGenerator {
    sites: Vec<Site>,
    table: weighted::Table<usize>,
    window_millis: u64,
}

impl SampleGenerator {
    /// Build a generator over `model`, stamping each sample with a window
    /// `window_millis` wide.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the model fails validation.
    pub fn new(model: &TrafficModel, window_millis: u64) -> Result<Self, Error> {
        model.validate()?;

        let mut sites = Vec::new();
        let mut weights = Vec::new();
        for (idx, (id, config)) in model.sites().enumerate() {
            let pages = config
                .pages
                .iter()
                .map(|(page_id, page)| Page {
                    id: *page_id,
                    weight: page.weight,
                    tags: page.tags.iter().copied().collect(),
                })
                .collect();
            sites.push(Site {
                id: id.clone(),
                pages,
            });
            weights.push((idx, config.weight));
        }
        let table = weighted::Table::build(weights)?;
        debug!(
            sites = sites.len(),
            selectable = table.len(),
            window_millis,
            "sample generator ready"
        );

        Ok(Self {
            sites,
            table,
            window_millis,
        })
    }

    /// Load the model from `source` and build a generator over it.
    ///
    /// # Errors
    ///
    /// See [`TrafficModel::load`] and [`SampleGenerator::new`].
    pub fn load(source: &ModelSource, window_millis: u64) -> Result<Self, Error> {
        let model = TrafficModel::load(source)?;
        Self::new(&model, window_millis)
    }

    /// The width of each sample's time window, in milliseconds.
    #[must_use]
    pub fn window_millis(&self) -> u64 {
        self.window_millis
    }

    /// Draw a sample whose time window opens at `start_millis`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sampling`] only if the distribution table and the site
    /// list disagree, which a validated model rules out.
    pub fn generate_at<R>(&self, rng: &mut R, start_millis: u64) -> Result<Sample<'_>, Error>
    where
        R: rand::Rng + ?Sized,
    {
        let idx = *self.table.sample(rng);
        let Some(site) = self.sites.get(idx) else {
            error!(
                idx,
                sites = self.sites.len(),
                "distribution table selected an unknown site"
            );
            return Err(Error::Sampling(format!(
                "site index {idx} out of range for {} sites",
                self.sites.len()
            )));
        };

        let mut page_ids = BTreeSet::new();
        let mut tag_fire_counts = BTreeMap::new();
        for page in &site.pages {
            if rng.random::<f64>() < page.weight {
                page_ids.insert(page.id);
                for tag in &page.tags {
                    tag_fire_counts.insert(*tag, TagFires::ONCE);
                }
            }
        }

        Ok(Sample {
            site_id: &site.id,
            time_window: TimeWindow {
                start: start_millis,
                end: start_millis.saturating_add(self.window_millis),
            },
            page_ids,
            tag_fire_counts,
        })
    }
}

impl<'a> Generator<'a> for SampleGenerator {
    type Output = Sample<'a>;
    type Error = Error;

    fn generate<R>(&'a self, rng: &mut R) -> Result<Self::Output, Self::Error>
    where
        R: rand::Rng + ?Sized,
    {
        self.generate_at(rng, now_millis())
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks set
/// before it.
#[must_use]
pub fn now_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Initialization state of a [`LazyGenerator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The model has not been loaded yet
    Uninitialized,
    /// The model loaded and the generator is ready to draw
    Ready,
    /// The model failed to load; the failure is permanent
    Failed,
}

/// A [`SampleGenerator`] built on first use
///
/// The first call to [`LazyGenerator::get`] loads the model while holding the
/// cell's lock. Concurrent first callers block until that load completes and
/// then observe its outcome. Success and failure are both final: every later
/// caller receives the same generator or the same error.
#[derive(Debug)]
pub struct LazyGenerator {
    source: ModelSource,
    window_millis: u64,
    cell: OnceCell<Result<Arc<SampleGenerator>, Arc<Error>>>,
}

impl LazyGenerator {
    /// Create a new, uninitialized, generator over the model at `source`.
    #[must_use]
    pub fn new(source: ModelSource, window_millis: u64) -> Self {
        Self {
            source,
            window_millis,
            cell: OnceCell::new(),
        }
    }

    /// Return the generator, loading the model if this is the first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] wrapping the load failure. The same
    /// failure is returned to every caller.
    pub fn get(&self) -> Result<&Arc<SampleGenerator>, Error> {
        let res = self.cell.get_or_init(|| {
            SampleGenerator::load(&self.source, self.window_millis)
                .map(Arc::new)
                .map_err(Arc::new)
        });
        match res {
            Ok(generator) => Ok(generator),
            Err(err) => Err(Error::Initialization(Arc::clone(err))),
        }
    }

    /// The current initialization state.
    #[must_use]
    pub fn state(&self) -> State {
        match self.cell.get() {
            None => State::Uninitialized,
            Some(Ok(_)) => State::Ready,
            Some(Err(_)) => State::Failed,
        }
    }
}
