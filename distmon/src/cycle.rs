//! One monitoring cycle: check the network, probe it, record the result and, when the buffer
//! has grown enough, upload it as a batch.

use std::path::PathBuf;

use data_model::MeasurementRecord;
use log::{info, warn};
use thiserror::Error;

use crate::batch::{consolidate, BatchArtifact};
use crate::buffer::{BufferError, BufferStore};
use crate::clock::{Chooser, Clock};
use crate::config::{Config, ConfigError};
use crate::guard::{is_on_expected_network, Association};
use crate::probe::{probe_fetch, probe_latency, probe_resolution, ProbeError, ProbeTools};
use crate::recorder::{record, Targets};
use crate::upload::{Transport, UploadClient, UploadError};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("Buffer '{}' holds {size} bytes, more than the limit of {ceiling}: refusing to run", root.display())]
    BufferFull {
        root: PathBuf,
        size: u64,
        ceiling: u64,
    },
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl CycleError {
    /// Errors no later cycle can recover from, as opposed to ones local to this cycle
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CycleError::Config(_) | CycleError::Buffer(BufferError::UnsafeRoot(_))
        )
    }
}

#[derive(Debug)]
pub enum BatchStatus {
    /// The buffer is below the threshold and nothing is in flight
    NotDue,
    /// A probe produced no timing, so no upload was attempted
    Degraded,
    /// These batches were uploaded and removed, together with their records
    Uploaded(Vec<String>),
    /// The upload failed and the batch stays in the buffer for a later cycle
    Retained { batch: String, error: UploadError },
}

#[derive(Debug)]
pub enum CycleReport {
    /// Not associated with the expected network: nothing was done
    OffNetwork { ssid: String },
    Recorded {
        record: MeasurementRecord,
        batch: BatchStatus,
    },
}

/// Everything a cycle needs from outside: configuration, and a way to reach each external
/// capability
pub struct Cycle<'a> {
    pub config: &'a Config,
    pub association: &'a dyn Association,
    pub tools: &'a dyn ProbeTools,
    pub transport: &'a dyn Transport,
    pub clock: &'a dyn Clock,
    pub chooser: &'a dyn Chooser,
}

impl<'a> Cycle<'a> {
    pub fn run(&self) -> Result<CycleReport, CycleError> {
        let config = self.config;
        config.validate()?;

        let store = BufferStore::open(&config.buffer.path, &config.buffer.installation)?;

        if !is_on_expected_network(self.association, &config.network.ssid) {
            return Ok(CycleReport::OffNetwork {
                ssid: config.network.ssid.clone(),
            });
        }

        let ceiling = config.buffer.ceiling_bytes;
        if store.is_full(ceiling)? {
            return Err(CycleError::BufferFull {
                root: store.root().to_path_buf(),
                size: store.total_size()?,
                ceiling,
            });
        }

        // Decided before this cycle's record is added
        let threshold = config.buffer.threshold_bytes;
        let consolidation_due = store.should_consolidate(threshold)?;
        info!(
            "Current buffer is {} bytes, will upload at {threshold} bytes",
            store.total_size()?
        );

        let start = self.clock.now();
        let timestamp = u64::try_from(start.timestamp()).unwrap_or_default();
        let targets = Targets::choose(&config.probes, self.chooser)
            .ok_or_else(|| ConfigError::Incomplete(vec!["probes".into()]))?;

        let ping = probe_latency(
            self.tools,
            &targets.ping_address,
            config.probes.ping_timeout_ms,
        )?;
        let resolution = probe_resolution(
            self.tools,
            self.clock,
            &targets.host,
            config.probes.resolver.as_deref(),
        )?;
        let fetch = probe_fetch(self.tools, self.clock, &targets.url);

        let record = record(&store, timestamp, &targets, ping, resolution, fetch)?;

        // Unlikely to be able to upload if not successful so far
        if !record.all_timed() {
            for outcome in [&record.ping, &record.resolution, &record.fetch] {
                if !outcome.has_timing() {
                    warn!("{} probe failed: {}", outcome.kind, outcome.detail);
                }
            }
            warn!("Not all probes succeeded, not uploading");
            return Ok(CycleReport::Recorded {
                record,
                batch: BatchStatus::Degraded,
            });
        }

        let batch = self.upload(&store, consolidation_due, timestamp)?;
        Ok(CycleReport::Recorded { record, batch })
    }

    /// Retry any batch left in flight by an earlier cycle, otherwise make and upload a new
    /// one if due. A new batch is never made while one is in flight, as it would include the
    /// in-flight batch's records a second time.
    fn upload(
        &self,
        store: &BufferStore,
        consolidation_due: bool,
        timestamp: u64,
    ) -> Result<BatchStatus, CycleError> {
        let in_flight = store.list_batches()?;

        let batches: Vec<BatchArtifact> = if !in_flight.is_empty() {
            info!("Retrying upload of {} batch(es) in flight", in_flight.len());
            in_flight
                .iter()
                .map(|name| BatchArtifact::load(store, name))
                .collect::<Result<_, _>>()?
        } else if consolidation_due {
            consolidate(store, timestamp)?.into_iter().collect()
        } else {
            return Ok(BatchStatus::NotDue);
        };

        let client = UploadClient::new(self.config, self.transport);
        let mut uploaded = vec![];
        for batch in batches {
            match client.upload_and_release(store, &batch, self.clock.now()) {
                Ok(()) => uploaded.push(batch.name),
                Err(error) => {
                    warn!("Keeping '{}' for a later upload: {error}", batch.name);
                    return Ok(BatchStatus::Retained {
                        batch: batch.name,
                        error,
                    });
                }
            }
        }

        Ok(BatchStatus::Uploaded(uploaded))
    }
}
