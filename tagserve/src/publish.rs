//! The publish boundary.
//!
//! Virtual users hand marshalled messages to a single [`Publisher`] task over a
//! bounded channel. The publisher writes each [`Record`] to its [`Sink`] as one
//! line, `"{key}\t{payload}"` when the record is keyed and `"{payload}"`
//! otherwise, the line format a kafka console producer reads with
//! `parse.key=true`. Broker connections, acknowledgements and retries belong
//! to whatever consumes these lines.
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes written to the sink, delimiters included
//! `records_published`: Records written to the sink
//!

use std::path::PathBuf;

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    io::{self, AsyncWrite, AsyncWriteExt, BufWriter},
    sync::mpsc,
};
use tracing::{info, trace};

/// Capacity of the channel between virtual users and the publisher.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Publisher`]
pub enum Error {
    /// Failed to open the sink file
    #[error("Failed to open sink {path:?}: {source}")]
    Open {
        /// Sink path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// Failed to write to the sink
    #[error("Failed to write to sink: {0}")]
    Io(#[from] std::io::Error),
    /// The publisher has stopped and no longer accepts records
    #[error("Publisher is closed")]
    Closed,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Destination for published records
pub enum Sink {
    /// Write records to standard out
    Stdout,
    /// Drop every record, counting it as published
    Discard,
    /// Append records to a file, creating it if needed
    File {
        /// Path of the file
        path: PathBuf,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the publish step
pub struct Config {
    /// Topic recorded with every message
    pub topic: String,
    /// Partition key recorded with every message, if any
    #[serde(default)]
    pub key: Option<u64>,
    /// Where records are written
    pub sink: Sink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message ready for the broker
pub struct Record {
    /// Destination topic
    pub topic: String,
    /// Partition key
    pub key: Option<u64>,
    /// Marshalled message
    pub payload: Bytes,
}

#[derive(Debug)]
/// Drains records from virtual users into a [`Sink`]
pub struct Publisher {
    sink: Sink,
    records: mpsc::Receiver<Record>,
    metric_labels: Vec<(String, String)>,
}

impl Publisher {
    /// Create a new [`Publisher`] and the sender virtual users publish
    /// through.
    #[must_use]
    pub fn new(sink: Sink, metric_labels: Vec<(String, String)>) -> (Self, mpsc::Sender<Record>) {
        let (snd, records) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                sink,
                records,
                metric_labels,
            },
            snd,
        )
    }

    /// Run [`Publisher`] until every sender has dropped, then flush.
    ///
    /// # Errors
    ///
    /// Function will return an error if the sink cannot be opened or written.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            sink,
            records,
            metric_labels,
        } = self;
        match sink {
            Sink::Stdout => drain(records, Some(io::stdout()), &metric_labels).await,
            Sink::Discard => drain(records, None::<io::Stdout>, &metric_labels).await,
            Sink::File { path } => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|source| Error::Open {
                        path: path.clone(),
                        source: Box::new(source),
                    })?;
                info!("Publishing to {}", path.display());
                drain(records, Some(file), &metric_labels).await
            }
        }
    }
}

async fn drain<W>(
    mut records: mpsc::Receiver<Record>,
    writer: Option<W>,
    labels: &[(String, String)],
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.map(|w| BufWriter::with_capacity(1 << 16, w));
    let mut line = Vec::with_capacity(512);
    while let Some(record) = records.recv().await {
        trace!(topic = %record.topic, key = ?record.key, bytes = record.payload.len(), "publishing record");
        encode_line(&record, &mut line);
        if let Some(ref mut writer) = writer {
            writer.write_all(&line).await?;
        }
        counter!("bytes_written", labels).increment(line.len() as u64);
        counter!("records_published", labels).increment(1);
    }
    if let Some(ref mut writer) = writer {
        writer.flush().await?;
    }
    Ok(())
}

/// Encode `record` as a single line into `buf`, replacing its contents.
pub fn encode_line(record: &Record, buf: &mut Vec<u8>) {
    buf.clear();
    if let Some(key) = record.key {
        buf.extend_from_slice(key.to_string().as_bytes());
        buf.push(b'\t');
    }
    buf.extend_from_slice(&record.payload);
    buf.push(b'\n');
}
