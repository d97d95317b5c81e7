use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use data_model::MeasurementRecord;
use log::{info, warn};
use md5::{Digest, Md5};

use crate::buffer::{BufferError, BufferStore};

/// A consolidated payload of buffered records, stored in the buffer until its upload is
/// confirmed
#[derive(Debug, Clone, PartialEq)]
pub struct BatchArtifact {
    pub name: String,
    pub content: Vec<u8>,
    /// Base64 of the MD5 digest of `content`, as sent in `Content-MD5`
    pub checksum: String,
    pub length: u64,
    /// Keys of the records whose bytes make up `content`
    pub sources: Vec<String>,
}

pub fn content_checksum(content: &[u8]) -> String {
    BASE64.encode(Md5::digest(content))
}

impl BatchArtifact {
    fn new(name: String, content: Vec<u8>, sources: Vec<String>) -> Self {
        BatchArtifact {
            name,
            checksum: content_checksum(&content),
            length: content.len() as u64,
            content,
            sources,
        }
    }

    /// Reload an in-flight batch left by an earlier run. The source records are recovered
    /// from the timestamp each line starts with.
    pub fn load(store: &BufferStore, name: &str) -> Result<Self, BufferError> {
        let content = store.read(name)?;
        let sources = source_keys(name, &content);
        Ok(BatchArtifact::new(name.to_owned(), content, sources))
    }
}

fn source_keys(name: &str, content: &[u8]) -> Vec<String> {
    let mut keys: Vec<String> = vec![];
    for line in String::from_utf8_lossy(content).lines() {
        match line.parse::<MeasurementRecord>() {
            Ok(record) => {
                let key = record.key();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            Err(e) => warn!("Batch '{name}': {e}"),
        }
    }
    keys
}

/// Merge every stored record into one new batch named for `timestamp`. In-flight batches are
/// not included. Returns `None`, writing nothing, when there are no records. The source
/// records are left in place.
pub fn consolidate(
    store: &BufferStore,
    timestamp: u64,
) -> Result<Option<BatchArtifact>, BufferError> {
    let sources = store.list_records()?;
    if sources.is_empty() {
        return Ok(None);
    }

    let mut content = vec![];
    for key in &sources {
        content.extend_from_slice(&store.read(key)?);
    }

    let artifact = BatchArtifact::new(store.batch_name(timestamp), content, sources);
    store.write(&artifact.name, &artifact.content)?;
    info!(
        "Consolidated {} records, {} bytes, into '{}'",
        artifact.sources.len(),
        artifact.length,
        artifact.name
    );

    Ok(Some(artifact))
}
