//! This module controls configuration parsing from the end user. Crashes are
//! most likely to originate from this code, intentionally.
//!
//! A configuration is a single YAML document:
//!
//! ```yaml
//! telemetry:
//!   addr: "0.0.0.0:9000"
//! generator:
//!   - id: website
//!     seed: [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53,
//!            59, 61, 67, 71, 73, 79, 83, 89, 97, 101, 103, 107, 109, 113, 127, 131]
//!     model:
//!       path: "/etc/tagserve/model.json"
//!     virtual_users: 4
//!     publish:
//!       topic: tag_request_metrics
//!       sink: stdout
//! ```
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use tracing::debug;

use crate::generator;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// Error for duplicate IDs in generators
    #[error("Duplicate generator ID found: {0}")]
    DuplicateGeneratorId(String),
    /// A generator is configured in a way that cannot run
    #[error("Invalid generator {index}: {source}")]
    InvalidGenerator {
        /// Position of the generator in the configuration
        index: usize,
        /// Underlying generator error
        #[source]
        source: Box<generator::Error>,
    },
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The method by which to express telemetry
    pub telemetry: Option<Telemetry>,
    /// The generators to run
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub generator: Vec<generator::Config>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of tagserve's telemetry.
pub enum Telemetry {
    /// In prometheus mode tagserve will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Check every generator and the uniqueness of their IDs.
    ///
    /// # Errors
    ///
    /// Returns the first generator that fails validation or the first
    /// duplicated generator ID.
    pub fn validate(&self) -> Result<(), Error> {
        let mut ids = FxHashSet::default();
        for (index, generator) in self.generator.iter().enumerate() {
            generator
                .validate()
                .map_err(|source| Error::InvalidGenerator {
                    index,
                    source: Box::new(source),
                })?;
            let Some(id) = &generator.id else {
                continue;
            };
            if !ids.insert(id.as_str()) {
                return Err(Error::DuplicateGeneratorId(id.clone()));
            }
        }
        Ok(())
    }
}

/// Parse and validate a configuration document.
///
/// # Errors
///
/// Returns an error if the document is not valid YAML, does not describe a
/// configuration or fails [`Config::validate`].
pub fn parse_config(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    debug!(generators = config.generator.len(), "configuration parsed");
    Ok(config)
}

/// Load configuration from a file path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or [`parse_config`] fails.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf};

    use proptest::prelude::*;
    use tagserve_payload::ModelSource;

    use super::{Config, Error, Telemetry, load_config_from_path, parse_config};
    use crate::{generator, publish};

    const SEED: &str = "[2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, \
                        59, 61, 67, 71, 73, 79, 83, 89, 97, 101, 103, 107, 109, 113, 127, 131]";

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let contents = format!(
            r#"
telemetry:
  addr: "127.0.0.1:9000"
  global_labels:
    experiment: baseline
generator:
  - id: website
    seed: {SEED}
    model:
      path: "/tmp/model.json"
    virtual_users: 4
    iterations: 1000
    publish:
      topic: tag_request_metrics
      key: 12
      sink:
        file:
          path: "/tmp/out.tsv"
"#
        );
        let config = parse_config(&contents)?;
        let Some(Telemetry::Prometheus {
            addr,
            global_labels,
        }) = &config.telemetry
        else {
            panic!("telemetry missing");
        };
        assert_eq!(addr.port(), 9000);
        assert_eq!(global_labels.get("experiment").map(String::as_str), Some("baseline"));

        let generator = &config.generator[0];
        assert_eq!(generator.id.as_deref(), Some("website"));
        assert_eq!(generator.seed[31], 131);
        assert_eq!(generator.model, ModelSource::Path(PathBuf::from("/tmp/model.json")));
        assert_eq!(generator.variable_name, "kafka_message");
        assert_eq!(generator.window_millis, 30);
        assert_eq!(generator.virtual_users, 4);
        assert_eq!(generator.iterations, Some(1000));
        assert_eq!(
            generator.publish,
            publish::Config {
                topic: "tag_request_metrics".to_string(),
                key: Some(12),
                sink: publish::Sink::File {
                    path: PathBuf::from("/tmp/out.tsv"),
                },
            }
        );
        Ok(())
    }

    #[test]
    fn inline_model_and_unit_sink() -> Result<(), Error> {
        let contents = format!(
            r#"
generator:
  - seed: {SEED}
    model:
      inline: '{{"s1": {{"weight": 1.0}}}}'
    variable_name: message
    window_millis: 50
    publish:
      topic: t
      sink: discard
"#
        );
        let config = parse_config(&contents)?;
        assert_eq!(config.telemetry, None);
        let generator: &generator::Config = &config.generator[0];
        assert_eq!(
            generator.model,
            ModelSource::Inline(r#"{"s1": {"weight": 1.0}}"#.to_string())
        );
        assert_eq!(generator.variable_name, "message");
        assert_eq!(generator.window_millis, 50);
        assert_eq!(generator.virtual_users, 1);
        assert_eq!(generator.publish.sink, publish::Sink::Discard);
        Ok(())
    }

    #[test]
    fn duplicate_generator_ids_rejected() {
        let generator = format!(
            "  - id: same\n    seed: {SEED}\n    model:\n      path: m.json\n    publish:\n      topic: t\n      sink: discard\n"
        );
        let contents = format!("generator:\n{generator}{generator}");
        let res = parse_config(&contents);
        assert!(matches!(res, Err(Error::DuplicateGeneratorId(id)) if id == "same"));
    }

    #[test]
    fn zero_virtual_users_rejected() {
        let contents = format!(
            "generator:\n  - seed: {SEED}\n    model:\n      path: m.json\n    virtual_users: 0\n    publish:\n      topic: t\n      sink: discard\n"
        );
        let res = parse_config(&contents);
        assert!(matches!(res, Err(Error::InvalidGenerator { index: 0, .. })));
    }

    #[test]
    fn unknown_field_rejected() {
        let contents = format!(
            "generator:\n  - seed: {SEED}\n    model:\n      path: m.json\n    rate: 10\n    publish:\n      topic: t\n      sink: discard\n"
        );
        assert!(matches!(parse_config(&contents), Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn empty_document_is_default() -> Result<(), Error> {
        assert_eq!(parse_config("{}")?, Config::default());
        Ok(())
    }

    #[test]
    fn load_from_file() -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new().expect("create config file");
        write!(
            file,
            "generator:\n  - seed: {SEED}\n    model:\n      path: m.json\n    publish:\n      topic: t\n      sink: stdout\n"
        )
        .expect("write config");
        let config = load_config_from_path(file.path())?;
        assert_eq!(config.generator.len(), 1);
        assert_eq!(config.generator[0].publish.sink, publish::Sink::Stdout);
        Ok(())
    }

    #[test]
    fn demo_config_parses() -> Result<(), Error> {
        let config = parse_config(include_str!("../../demos/tagserve.yaml"))?;
        assert_eq!(config.generator.len(), 1);
        assert_eq!(config.generator[0].virtual_users, 4);
        assert_eq!(config.generator[0].iterations, Some(250));
        Ok(())
    }

    #[test]
    fn missing_file_is_read_error() {
        let res = load_config_from_path(&PathBuf::from("/nonexistent/tagserve.yaml"));
        assert!(matches!(res, Err(Error::ReadFile { .. })));
    }

    proptest! {
        #[test]
        fn distinct_ids_accepted(count in 1usize..8) {
            let mut contents = String::from("generator:\n");
            for i in 0..count {
                contents.push_str(&format!(
                    "  - id: gen{i}\n    seed: {SEED}\n    model:\n      path: m.json\n    publish:\n      topic: t\n      sink: discard\n"
                ));
            }
            let config = parse_config(&contents).expect("distinct ids are valid");
            prop_assert_eq!(config.generator.len(), count);
        }
    }
}
