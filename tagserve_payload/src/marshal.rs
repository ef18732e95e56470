//! Tag request metrics messages.
//!
//! A [`Sample`] is rendered to the wire as one JSON object:
//!
//! ```json
//! {"siteId":"s1","interval":{"start":1404000000000,"end":1404000000030},
//!  "source":"website","robot":false,"debug":false,
//!  "pageIds":[100],"tagFires":{"1":[1,0,0],"2":[1,0,0]}}
//! ```
//!
//! `robot` and `debug` are metadata flags owned by the downstream schema. They
//! are not modeled by the generator and always encode as false.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
    sync::Arc,
};

use rand::Rng;
use serde::{Deserialize, Serialize as SerdeSerialize};

use crate::{
    Error, Generator,
    generator::{Sample, SampleGenerator, TagFires, TimeWindow},
    model::{PageId, TagId},
};

/// Origin of a tag request
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerdeSerialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Requests served to a website
    Website,
}

/// Wire form of a [`Sample`]
#[derive(Debug, SerdeSerialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagRequestMetrics<'a> {
    /// The drawn site
    #[serde(borrow)]
    pub site_id: &'a str,
    /// The request interval
    pub interval: TimeWindow,
    /// Origin of the request
    pub source: Source,
    /// Robot traffic flag, never set
    pub robot: bool,
    /// Debug traffic flag, never set
    pub debug: bool,
    /// Pages selected in this request
    pub page_ids: BTreeSet<PageId>,
    /// Fire counts per tag
    pub tag_fires: BTreeMap<TagId, TagFires>,
}

impl<'a> From<&Sample<'a>> for TagRequestMetrics<'a> {
    fn from(sample: &Sample<'a>) -> Self {
        Self {
            site_id: sample.site_id,
            interval: sample.time_window,
            source: Source::Website,
            robot: false,
            debug: false,
            page_ids: sample.page_ids.clone(),
            tag_fires: sample.tag_fire_counts.clone(),
        }
    }
}

/// Render samples onto a writer
pub trait Marshal {
    /// Write the wire form of `sample` into `writer`. No trailing delimiter is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the writer fails.
    fn marshal<W>(&self, sample: &Sample<'_>, writer: &mut W) -> Result<(), Error>
    where
        W: Write;
}

/// Marshals samples as [`TagRequestMetrics`] JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshal for JsonMarshaller {
    fn marshal<W>(&self, sample: &Sample<'_>, writer: &mut W) -> Result<(), Error>
    where
        W: Write,
    {
        serde_json::to_writer(writer, &TagRequestMetrics::from(sample))?;
        Ok(())
    }
}

/// Tag request metrics payload: a generator paired with a marshaller
#[derive(Debug, Clone)]
pub struct TagRequest<M = JsonMarshaller> {
    generator: Arc<SampleGenerator>,
    marshaller: M,
}

impl TagRequest<JsonMarshaller> {
    /// Create a JSON tag request payload over `generator`.
    #[must_use]
    pub fn new(generator: Arc<SampleGenerator>) -> Self {
        Self::with_marshaller(generator, JsonMarshaller)
    }
}

impl<M> TagRequest<M>
where
    M: Marshal,
{
    /// Create a tag request payload with a custom marshaller.
    #[must_use]
    pub fn with_marshaller(generator: Arc<SampleGenerator>, marshaller: M) -> Self {
        Self {
            generator,
            marshaller,
        }
    }

    /// Draw one sample and marshal it.
    ///
    /// # Errors
    ///
    /// Returns an error if the draw or the encoding fails.
    pub fn next_message<R>(&self, rng: &mut R) -> Result<Vec<u8>, Error>
    where
        R: Rng + ?Sized,
    {
        let sample = self.generator.generate(rng)?;
        let mut buffer = Vec::with_capacity(128);
        self.marshaller.marshal(&sample, &mut buffer)?;
        Ok(buffer)
    }
}

impl<M> crate::Serialize for TagRequest<M>
where
    M: Marshal,
{
    fn to_bytes<W, R>(&mut self, mut rng: R, max_bytes: usize, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + Sized,
        W: Write,
    {
        let mut bytes_remaining = max_bytes;
        loop {
            let message = self.next_message(&mut rng)?;
            let line_length = message.len() + 1; // add one for the newline
            match bytes_remaining.checked_sub(line_length) {
                Some(remainder) => {
                    writer.write_all(&message)?;
                    writer.write_all(b"\n")?;
                    bytes_remaining = remainder;
                }
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::{JsonMarshaller, Marshal, TagRequest, TagRequestMetrics};
    use crate::{SampleGenerator, Serialize, TagFires, TrafficModel};

    const MODEL: &str = r#"{
        "s1": {"weight": 0.6, "pages": {"100": {"weight": 1.0, "tags": [1, 2]},
                                        "101": {"weight": 0.5, "tags": [2, 3]}}},
        "s2": {"weight": 0.4, "pages": {"200": {"weight": 0.9, "tags": [9]}}}
    }"#;

    fn generator() -> Arc<SampleGenerator> {
        let model: TrafficModel = MODEL.parse().expect("valid model");
        Arc::new(SampleGenerator::new(&model, 30).expect("valid generator"))
    }

    #[test]
    fn json_layout() {
        let model: TrafficModel = r#"{"s1":{"weight":1.0,"pages":{"100":{"weight":1.0,"tags":[1,2]}}}}"#
            .parse()
            .expect("valid model");
        let generator = SampleGenerator::new(&model, 30).expect("valid generator");
        let mut rng = SmallRng::seed_from_u64(0);
        let sample = generator.generate_at(&mut rng, 1_000).expect("draw");

        let mut bytes = Vec::new();
        JsonMarshaller.marshal(&sample, &mut bytes).expect("marshal");
        assert_eq!(
            std::str::from_utf8(&bytes).expect("utf-8"),
            r#"{"siteId":"s1","interval":{"start":1000,"end":1030},"source":"website","robot":false,"debug":false,"pageIds":[100],"tagFires":{"1":[1,0,0],"2":[1,0,0]}}"#
        );
    }

    #[test]
    fn next_message_is_one_object() {
        let payload = TagRequest::new(generator());
        let mut rng = SmallRng::seed_from_u64(42);
        let message = payload.next_message(&mut rng).expect("message");
        let metrics: TagRequestMetrics =
            serde_json::from_slice(&message).expect("message deserializes");
        assert!(metrics.site_id == "s1" || metrics.site_id == "s2");
        assert!(!metrics.robot && !metrics.debug);
        assert_eq!(metrics.interval.end - metrics.interval.start, 30);
        for fires in metrics.tag_fires.values() {
            assert_eq!(*fires, TagFires::ONCE);
        }
    }

    // We want to be sure that the serialized size of the payload does not
    // exceed `max_bytes`.
    proptest! {
        #[test]
        fn payload_not_exceed_max_bytes(seed: u64, max_bytes: u16) {
            let max_bytes = max_bytes as usize;
            let rng = SmallRng::seed_from_u64(seed);
            let mut payload = TagRequest::new(generator());

            let mut bytes = Vec::with_capacity(max_bytes);
            payload.to_bytes(rng, max_bytes, &mut bytes).expect("failed to convert to bytes");
            prop_assert!(bytes.len() <= max_bytes);
        }
    }

    // We want to know that every payload produced by this type actually
    // deserializes as json, is not truncated etc.
    proptest! {
        #[test]
        fn every_payload_deserializes(seed: u64, max_bytes: u16)  {
            let max_bytes = max_bytes as usize;
            let rng = SmallRng::seed_from_u64(seed);
            let mut payload = TagRequest::new(generator());

            let mut bytes: Vec<u8> = Vec::with_capacity(max_bytes);
            payload.to_bytes(rng, max_bytes, &mut bytes).expect("failed to convert to bytes");

            let payload = std::str::from_utf8(&bytes).expect("failed to convert from utf-8 to str");
            for msg in payload.lines() {
                let metrics: TagRequestMetrics = serde_json::from_str(msg).expect("failed to deserialize from str");
                prop_assert!(metrics.site_id == "s1" || metrics.site_id == "s2");
            }
        }
    }
}
