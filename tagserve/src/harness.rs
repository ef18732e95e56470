//! The iteration contract between a virtual user and the generator.
//!
//! Each iteration of a virtual user runs two steps against its own
//! [`Variables`]. [`TagserveElement::iteration_start`] draws one tag request
//! and stores the marshalled message under a named slot, then
//! [`ProducerSampler::run_test`] reads that slot and hands the message to the
//! publisher. The generator behind every element of a run is shared and is
//! built on the first iteration of whichever virtual user gets there first.

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tagserve_payload::{LazyGenerator, ModelSource, TagRequest};
use tokio::sync::mpsc;
use tracing::trace;

use crate::publish::{self, Record};

/// Default name of the slot a message is stored under.
pub const DEFAULT_VARIABLE_NAME: &str = "kafka_message";

/// Default `variable_name` for serde.
#[must_use]
pub fn default_variable_name() -> String {
    DEFAULT_VARIABLE_NAME.to_string()
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by the harness steps
pub enum Error {
    /// The generator could not be built or could not draw.
    #[error(transparent)]
    Payload(#[from] tagserve_payload::Error),
    /// The named slot holds no message.
    #[error("No message stored under variable {0:?}")]
    MissingVariable(String),
    /// See [`crate::publish::Error`] for details.
    #[error(transparent)]
    Publish(#[from] publish::Error),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// The properties of a [`TagserveElement`]
pub struct Config {
    /// Where the traffic model is read from
    pub model: ModelSource,
    /// Slot the marshalled message is stored under
    #[serde(default = "default_variable_name")]
    pub variable_name: String,
}

#[derive(Debug, Default, Clone)]
/// Named slots local to one virtual user
pub struct Variables {
    inner: FxHashMap<String, Bytes>,
}

impl Variables {
    /// Store `value` under `name`, replacing any previous value.
    pub fn put(&mut self, name: &str, value: Bytes) {
        self.inner.insert(name.to_string(), value);
    }

    /// The value stored under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.inner.get(name)
    }

    /// Remove and return the value stored under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        self.inner.remove(name)
    }

    /// Names and values of every slot, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, Clone)]
/// Draws one tag request per iteration into a [`Variables`] slot
pub struct TagserveElement {
    generator: Arc<LazyGenerator>,
    variable_name: String,
}

impl TagserveElement {
    /// Create a new [`TagserveElement`] over a shared generator.
    #[must_use]
    pub fn new(generator: Arc<LazyGenerator>, variable_name: String) -> Self {
        Self {
            generator,
            variable_name,
        }
    }

    /// Create a new [`TagserveElement`] with its own generator, as configured.
    #[must_use]
    pub fn from_config(config: Config, window_millis: u64) -> Self {
        Self::new(
            Arc::new(LazyGenerator::new(config.model, window_millis)),
            config.variable_name,
        )
    }

    /// The slot this element writes to.
    #[must_use]
    pub fn variable_name(&self) -> &str {
        &self.variable_name
    }

    /// Draw and marshal one tag request, storing it under the configured
    /// variable name.
    ///
    /// The first call across all elements sharing this generator loads the
    /// model.
    ///
    /// # Errors
    ///
    /// Function will return an error if the model fails to load, in which case
    /// every later iteration fails the same way, or if the draw fails.
    pub fn iteration_start<R>(&self, rng: &mut R, variables: &mut Variables) -> Result<(), Error>
    where
        R: Rng + ?Sized,
    {
        let generator = self.generator.get()?;
        let message = TagRequest::new(Arc::clone(generator)).next_message(rng)?;
        trace!(
            variable = %self.variable_name,
            bytes = message.len(),
            "stored tag request"
        );
        variables.put(&self.variable_name, Bytes::from(message));
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Publishes the message stored in a [`Variables`] slot
pub struct ProducerSampler {
    topic: String,
    key: Option<u64>,
    variable_name: String,
    records: mpsc::Sender<Record>,
}

impl ProducerSampler {
    /// Create a new [`ProducerSampler`] publishing through `records`.
    #[must_use]
    pub fn new(
        config: &publish::Config,
        variable_name: String,
        records: mpsc::Sender<Record>,
    ) -> Self {
        Self {
            topic: config.topic.clone(),
            key: config.key,
            variable_name,
            records,
        }
    }

    /// Hand the message stored under the configured variable to the
    /// publisher. The slot is left untouched.
    ///
    /// # Errors
    ///
    /// Function will return [`Error::MissingVariable`] if the slot is empty
    /// and [`publish::Error::Closed`] if the publisher has stopped.
    pub async fn run_test(&self, variables: &Variables) -> Result<(), Error> {
        let payload = variables
            .get(&self.variable_name)
            .cloned()
            .ok_or_else(|| Error::MissingVariable(self.variable_name.clone()))?;
        self.records
            .send(Record {
                topic: self.topic.clone(),
                key: self.key,
                payload,
            })
            .await
            .map_err(|_| publish::Error::Closed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{SeedableRng, rngs::SmallRng};
    use tagserve_payload::{LazyGenerator, ModelSource, State, marshal::TagRequestMetrics};
    use tokio::sync::mpsc;

    use super::{Config, Error, ProducerSampler, TagserveElement, Variables};
    use crate::publish;

    const MODEL: &str = r#"{"s1": {"weight": 1.0, "pages": {"100": {"weight": 1.0, "tags": [1, 2]}}}}"#;

    fn element() -> TagserveElement {
        TagserveElement::from_config(
            Config {
                model: ModelSource::Inline(MODEL.to_string()),
                variable_name: "kafka_message".to_string(),
            },
            30,
        )
    }

    fn publish_config(key: Option<u64>) -> publish::Config {
        publish::Config {
            topic: "metrics".to_string(),
            key,
            sink: publish::Sink::Discard,
        }
    }

    #[test]
    fn config_defaults_variable_name() {
        let config: Config =
            serde_json::from_str(r#"{"model": {"path": "model.json"}}"#).expect("valid config");
        assert_eq!(
            config,
            Config {
                model: ModelSource::Path("model.json".into()),
                variable_name: "kafka_message".to_string(),
            }
        );
        assert_eq!(config.clone(), config);
    }

    #[test]
    fn iteration_stores_message() {
        let element = element();
        let mut rng = SmallRng::seed_from_u64(1);
        let mut variables = Variables::default();
        element
            .iteration_start(&mut rng, &mut variables)
            .expect("iteration");

        let message = variables.get("kafka_message").expect("slot filled");
        let metrics: TagRequestMetrics =
            serde_json::from_slice(message).expect("message deserializes");
        assert_eq!(metrics.site_id, "s1");
        assert_eq!(metrics.page_ids.into_iter().collect::<Vec<_>>(), [100]);
        assert_eq!(variables.len(), 1);
    }

    #[test]
    fn iterations_overwrite_slot() {
        let element = element();
        let mut rng = SmallRng::seed_from_u64(1);
        let mut variables = Variables::default();
        for _ in 0..3 {
            element
                .iteration_start(&mut rng, &mut variables)
                .expect("iteration");
        }
        assert_eq!(variables.len(), 1);
    }

    #[test]
    fn shared_generator_fails_for_every_element() {
        let generator = Arc::new(LazyGenerator::new(
            ModelSource::Inline(r#"{"s1": {"weight": 0.5, "pages": {}}}"#.to_string()),
            30,
        ));
        let first = TagserveElement::new(Arc::clone(&generator), "a".to_string());
        let second = TagserveElement::new(Arc::clone(&generator), "b".to_string());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut variables = Variables::default();

        for element in [&first, &second] {
            let res = element.iteration_start(&mut rng, &mut variables);
            assert!(matches!(
                res,
                Err(Error::Payload(tagserve_payload::Error::Initialization(_)))
            ));
        }
        assert_eq!(generator.state(), State::Failed);
        assert!(variables.is_empty());
    }

    #[tokio::test]
    async fn run_test_publishes_slot() {
        let (snd, mut rcv) = mpsc::channel(4);
        let sampler = ProducerSampler::new(&publish_config(Some(3)), "kafka_message".to_string(), snd);
        let mut variables = Variables::default();
        variables.put("kafka_message", bytes::Bytes::from_static(b"{}"));

        sampler.run_test(&variables).await.expect("published");
        let record = rcv.recv().await.expect("record sent");
        assert_eq!(record.topic, "metrics");
        assert_eq!(record.key, Some(3));
        assert_eq!(&record.payload[..], b"{}");
        assert!(variables.get("kafka_message").is_some());
    }

    #[tokio::test]
    async fn run_test_without_message() {
        let (snd, _rcv) = mpsc::channel(4);
        let sampler = ProducerSampler::new(&publish_config(None), "kafka_message".to_string(), snd);
        let res = sampler.run_test(&Variables::default()).await;
        assert!(matches!(res, Err(Error::MissingVariable(name)) if name == "kafka_message"));
    }

    #[tokio::test]
    async fn run_test_after_publisher_stops() {
        let (snd, rcv) = mpsc::channel(4);
        drop(rcv);
        let sampler = ProducerSampler::new(&publish_config(None), "m".to_string(), snd);
        let mut variables = Variables::default();
        variables.put("m", bytes::Bytes::from_static(b"{}"));
        let res = sampler.run_test(&variables).await;
        assert!(matches!(res, Err(Error::Publish(publish::Error::Closed))));
    }
}
