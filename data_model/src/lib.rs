use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Recorded as the latency when the target did not answer at all (100% packet loss)
pub const UNREACHABLE: i64 = -100;

/// Recorded when a probe completed but produced no usable timing
pub const NO_TIMING: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// One echo request to an IP address, timed in milliseconds
    Latency,
    /// One name lookup, timed in whole seconds
    Resolution,
    /// One HTTP GET of a page, timed in whole seconds
    Fetch,
}

impl Display for ProbeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Latency => write!(f, "Latency"),
            ProbeKind::Resolution => write!(f, "Resolution"),
            ProbeKind::Fetch => write!(f, "Fetch"),
        }
    }
}

/// The result of running one probe. `elapsed` is non-negative when a timing was measured,
/// otherwise one of the sentinels [UNREACHABLE] or [NO_TIMING].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub kind: ProbeKind,
    pub succeeded: bool,
    pub elapsed: i64,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn success(kind: ProbeKind, elapsed: i64, detail: impl Into<String>) -> Self {
        ProbeOutcome {
            kind,
            succeeded: true,
            elapsed,
            detail: detail.into(),
        }
    }

    pub fn failure(kind: ProbeKind, elapsed: i64, detail: impl Into<String>) -> Self {
        ProbeOutcome {
            kind,
            succeeded: false,
            elapsed,
            detail: detail.into(),
        }
    }

    pub fn has_timing(&self) -> bool {
        self.elapsed >= 0
    }
}

/// One cycle's measurements. The timestamp (seconds since the epoch) doubles as the key the
/// record is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRecord {
    pub timestamp: u64,
    pub ping_address: String,
    pub ping: ProbeOutcome,
    pub host: String,
    pub resolution: ProbeOutcome,
    pub url: String,
    pub fetch: ProbeOutcome,
}

impl MeasurementRecord {
    pub fn key(&self) -> String {
        self.timestamp.to_string()
    }

    /// True if every probe produced a timing
    pub fn all_timed(&self) -> bool {
        self.ping.has_timing() && self.resolution.has_timing() && self.fetch.has_timing()
    }
}

/// The single delimited line a record is stored as, without the line terminator
impl Display for MeasurementRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}, {}",
            self.timestamp,
            self.ping_address,
            self.ping.elapsed,
            self.host,
            self.resolution.elapsed,
            self.url,
            self.fetch.elapsed
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseRecordError(pub String);

impl Display for ParseRecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Could not parse measurement record: {}", self.0)
    }
}

impl std::error::Error for ParseRecordError {}

fn parse_field<T: FromStr>(field: Option<&str>, name: &str) -> Result<T, ParseRecordError> {
    let value = field.ok_or_else(|| ParseRecordError(format!("missing {name}")))?;
    value
        .parse()
        .map_err(|_| ParseRecordError(format!("bad {name} '{value}'")))
}

fn stored_outcome(kind: ProbeKind, elapsed: i64) -> ProbeOutcome {
    ProbeOutcome {
        kind,
        succeeded: elapsed >= 0,
        elapsed,
        detail: String::new(),
    }
}

/// Parses a stored line back into a record. Probe details are not stored, so they come back
/// empty and `succeeded` is inferred from the timing.
impl FromStr for MeasurementRecord {
    type Err = ParseRecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.trim_end().split(", ");
        let timestamp = parse_field(fields.next(), "timestamp")?;
        let ping_address = parse_field(fields.next(), "ping address")?;
        let ping = parse_field(fields.next(), "ping time")?;
        let host = parse_field(fields.next(), "host")?;
        let resolution = parse_field(fields.next(), "resolution time")?;
        let url = parse_field(fields.next(), "url")?;
        let fetch = parse_field(fields.next(), "fetch time")?;
        if fields.next().is_some() {
            return Err(ParseRecordError("too many fields".into()));
        }

        Ok(MeasurementRecord {
            timestamp,
            ping_address,
            ping: stored_outcome(ProbeKind::Latency, ping),
            host,
            resolution: stored_outcome(ProbeKind::Resolution, resolution),
            url,
            fetch: stored_outcome(ProbeKind::Fetch, fetch),
        })
    }
}
