//! The tagserve generator.
//!
//! A generator runs a fixed number of virtual users against one traffic
//! model. Every virtual user loops over the two harness steps, drawing a tag
//! request into its variables and publishing it, until its iteration budget is
//! spent or shutdown is signaled. The virtual users of a generator share one
//! lazily built [`LazyGenerator`] and one [`Publisher`].
//!
//! ## Metrics
//!
//! `samples_generated`: Tag requests drawn and marshalled
//! `sample_failure`: Draws that failed, labeled by `error` kind; the virtual
//! user stops
//!
//! Additional metrics are emitted by the [`Publisher`].
//!

use std::sync::Arc;

use metrics::counter;
use rand::{
    Rng, SeedableRng,
    rngs::{SmallRng, StdRng},
};
use serde::{Deserialize, Serialize};
use tagserve_payload::{LazyGenerator, ModelSource, State, generator::default_window_millis};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::{
    harness::{self, ProducerSampler, TagserveElement, Variables, default_variable_name},
    publish::{self, Publisher},
    signals::Shutdown,
};

fn default_virtual_users() -> u16 {
    1
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Tagserve`].
pub enum Error {
    /// See [`crate::harness::Error`] for details.
    #[error(transparent)]
    Harness(#[from] harness::Error),
    /// See [`crate::publish::Error`] for details.
    #[error(transparent)]
    Publish(#[from] publish::Error),
    /// The traffic model could not be loaded.
    #[error(transparent)]
    Payload(#[from] tagserve_payload::Error),
    /// A virtual user or the publisher panicked.
    #[error("Child join error: {0}")]
    Child(#[from] JoinError),
    /// The configuration asks for something that cannot run.
    #[error("Invalid generator configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of [`Tagserve`]
pub struct Config {
    /// The ID assigned to this generator
    #[serde(default)]
    pub id: Option<String>,
    /// The seed for random operations of this generator
    pub seed: [u8; 32],
    /// Where the traffic model is read from
    pub model: ModelSource,
    /// Slot each iteration stores its message under
    #[serde(default = "default_variable_name")]
    pub variable_name: String,
    /// Width of each sample's time window, in milliseconds
    #[serde(default = "default_window_millis")]
    pub window_millis: u64,
    /// Number of concurrent virtual users
    #[serde(default = "default_virtual_users")]
    pub virtual_users: u16,
    /// Iterations each virtual user runs before stopping, unbounded if unset
    #[serde(default)]
    pub iterations: Option<u64>,
    /// Where messages are published
    pub publish: publish::Config,
}

impl Config {
    /// Check the parts of the configuration serde cannot.
    ///
    /// # Errors
    ///
    /// Function will return an error if no virtual user is requested or the
    /// variable name is empty.
    pub fn validate(&self) -> Result<(), Error> {
        if self.virtual_users == 0 {
            return Err(Error::InvalidConfig(
                "virtual_users must be at least 1".to_string(),
            ));
        }
        if self.variable_name.is_empty() {
            return Err(Error::InvalidConfig(
                "variable_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn metric_labels(id: Option<&str>) -> Vec<(String, String)> {
    let mut labels = vec![
        ("component".to_string(), "generator".to_string()),
        ("component_name".to_string(), "tagserve".to_string()),
    ];
    if let Some(id) = id {
        labels.push(("id".to_string(), id.to_string()));
    }
    labels
}

#[derive(Debug)]
/// The tagserve generator.
///
/// Owns the virtual users and the publisher they feed.
pub struct Tagserve {
    handles: JoinSet<Result<u64, Error>>,
    publisher: JoinHandle<Result<(), publish::Error>>,
    generator: Arc<LazyGenerator>,
}

impl Tagserve {
    /// Create a new [`Tagserve`] instance and start its virtual users. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Function will return an error if the configuration fails validation.
    /// The traffic model is not loaded here; see [`Tagserve::spin`].
    pub fn new(config: &Config, shutdown: Shutdown) -> Result<Self, Error> {
        config.validate()?;
        let mut rng = StdRng::from_seed(config.seed);
        let labels = metric_labels(config.id.as_deref());

        let generator = Arc::new(LazyGenerator::new(
            config.model.clone(),
            config.window_millis,
        ));
        let (publisher, records) = Publisher::new(config.publish.sink.clone(), labels.clone());
        let publisher = tokio::spawn(publisher.spin());

        let mut handles = JoinSet::new();
        for i in 0..config.virtual_users {
            let mut worker_labels = labels.clone();
            if config.virtual_users > 1 {
                worker_labels.push(("worker".to_string(), i.to_string()));
            }
            let user = VirtualUser {
                element: TagserveElement::new(
                    Arc::clone(&generator),
                    config.variable_name.clone(),
                ),
                sampler: ProducerSampler::new(
                    &config.publish,
                    config.variable_name.clone(),
                    records.clone(),
                ),
                rng: SmallRng::seed_from_u64(rng.random()),
                iterations: config.iterations,
                metric_labels: worker_labels,
                shutdown: shutdown.clone(),
            };
            handles.spawn(user.spin());
        }
        debug!(
            virtual_users = config.virtual_users,
            iterations = ?config.iterations,
            "tagserve generator started"
        );

        Ok(Self {
            handles,
            publisher,
            generator,
        })
    }

    /// The initialization state of the shared generator.
    #[must_use]
    pub fn state(&self) -> State {
        self.generator.state()
    }

    /// Run [`Tagserve`] until every virtual user stops, then wait for the
    /// publisher to drain. Returns the total number of iterations completed.
    ///
    /// # Errors
    ///
    /// Function will return an error if the traffic model fails to load, the
    /// publisher fails, or a child task panics. When a virtual user finds the
    /// publisher closed, the publisher's own error is returned.
    pub async fn spin(mut self) -> Result<u64, Error> {
        let mut completed = 0;
        while let Some(res) = self.handles.join_next().await {
            match res {
                Ok(Ok(iterations)) => completed += iterations,
                Ok(Err(Error::Harness(harness::Error::Publish(publish::Error::Closed)))) => {
                    self.publisher.await??;
                    return Err(Error::Publish(publish::Error::Closed));
                }
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(Error::Child(err)),
            }
        }
        self.publisher.await??;
        info!(completed, "tagserve generator finished");
        Ok(completed)
    }
}

struct VirtualUser {
    element: TagserveElement,
    sampler: ProducerSampler,
    rng: SmallRng,
    iterations: Option<u64>,
    metric_labels: Vec<(String, String)>,
    shutdown: Shutdown,
}

impl VirtualUser {
    async fn spin(mut self) -> Result<u64, Error> {
        let mut variables = Variables::default();
        let mut completed = 0;

        loop {
            if self.iterations.is_some_and(|max| completed >= max) {
                debug!(completed, "iteration budget spent");
                break;
            }
            if self.shutdown.is_signaled() {
                break;
            }

            if let Err(err) = self.element.iteration_start(&mut self.rng, &mut variables) {
                let kind = failure_kind(&err);
                error!("Tag request draw failed ({kind}), stopping virtual user: {err}");
                let mut error_labels = self.metric_labels.clone();
                error_labels.push(("error".to_string(), kind.to_string()));
                counter!("sample_failure", &error_labels).increment(1);
                return Err(match err {
                    harness::Error::Payload(err) => Error::Payload(err),
                    err => Error::Harness(err),
                });
            }
            counter!("samples_generated", &self.metric_labels).increment(1);

            tokio::select! {
                biased;

                () = self.shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                res = self.sampler.run_test(&variables) => res?,
            }
            completed += 1;
        }
        Ok(completed)
    }
}

/// The `error` label of `sample_failure` for `err`.
fn failure_kind(err: &harness::Error) -> &'static str {
    match err {
        harness::Error::Payload(tagserve_payload::Error::Initialization(_)) => "initialization",
        harness::Error::Payload(tagserve_payload::Error::Sampling(_)) => "sampling",
        harness::Error::Payload(_) => "marshal",
        harness::Error::MissingVariable(_) => "missing_variable",
        harness::Error::Publish(_) => "publish",
    }
}
