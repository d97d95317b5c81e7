use data_model::{MeasurementRecord, ProbeOutcome};
use log::info;

use crate::buffer::{BufferError, BufferStore};
use crate::clock::{choose, Chooser};
use crate::config::ProbeSpec;

/// What one cycle probes, picked from the configured pools
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    pub ping_address: String,
    pub host: String,
    pub url: String,
}

impl Targets {
    /// `None` if any pool is empty
    pub fn choose(probes: &ProbeSpec, chooser: &dyn Chooser) -> Option<Targets> {
        Some(Targets {
            ping_address: choose(chooser, &probes.ping_addresses)?.to_owned(),
            host: choose(chooser, &probes.hosts)?.to_owned(),
            url: choose(chooser, &probes.urls)?.to_owned(),
        })
    }
}

/// Assemble the cycle's record and store it in the buffer under its timestamp, as one line
pub fn record(
    store: &BufferStore,
    timestamp: u64,
    targets: &Targets,
    ping: ProbeOutcome,
    resolution: ProbeOutcome,
    fetch: ProbeOutcome,
) -> Result<MeasurementRecord, BufferError> {
    let record = MeasurementRecord {
        timestamp,
        ping_address: targets.ping_address.clone(),
        ping,
        host: targets.host.clone(),
        resolution,
        url: targets.url.clone(),
        fetch,
    };

    store.write(&record.key(), format!("{record}\n").as_bytes())?;
    info!("Recorded: {record}");

    Ok(record)
}

#[cfg(test)]
mod test {
    use data_model::{ProbeKind, ProbeOutcome, NO_TIMING};

    use super::{record, Targets};
    use crate::buffer::BufferStore;
    use crate::clock::Chooser;
    use crate::config::ProbeSpec;

    struct Second;

    impl Chooser for Second {
        fn pick(&self, _len: usize) -> usize {
            1
        }
    }

    fn targets() -> Targets {
        Targets {
            ping_address: "8.8.8.8".into(),
            host: "google.com".into(),
            url: "http://bbc.co.uk".into(),
        }
    }

    #[test]
    fn choose_targets() {
        let chosen = Targets::choose(&ProbeSpec::default(), &Second).unwrap();
        assert_eq!(chosen.ping_address, "4.2.2.2");
        assert_eq!(chosen.host, "bbc.co.uk");
        assert_eq!(chosen.url, "http://google.com");
    }

    #[test]
    fn no_targets_from_empty_pool() {
        let probes = ProbeSpec {
            urls: vec![],
            ..ProbeSpec::default()
        };
        assert_eq!(Targets::choose(&probes, &Second), None);
    }

    #[test]
    fn one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open(dir.path(), "kitchen").unwrap();

        let stored = record(
            &store,
            1700000000,
            &targets(),
            ProbeOutcome::success(ProbeKind::Latency, 23, ""),
            ProbeOutcome::success(ProbeKind::Resolution, 0, ""),
            ProbeOutcome::failure(ProbeKind::Fetch, NO_TIMING, "timeout"),
        )
        .unwrap();

        assert_eq!(stored.key(), "1700000000");
        assert_eq!(store.list_records().unwrap(), vec!["1700000000"]);
        assert_eq!(
            store.read("1700000000").unwrap(),
            b"1700000000, 8.8.8.8, 23, google.com, 0, http://bbc.co.uk, -1\n"
        );
    }
}
