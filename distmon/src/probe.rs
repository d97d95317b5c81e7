//! The three network checks run each cycle.
//!
//! Each check is split in two: a [ProbeTools] method that runs the underlying tool and returns
//! its raw result, and a `probe_*` function that times it and classifies the result into a
//! [ProbeOutcome] or a fatal [ProbeError]. Latency and resolution failures mean the network
//! itself is broken and abort the cycle; a failed fetch is only recorded.

use std::io;
use std::process::Command;

use curl::easy::Easy;
use data_model::{ProbeKind, ProbeOutcome, NO_TIMING, UNREACHABLE};
use log::{debug, info, warn};
use thiserror::Error;

use crate::clock::{whole_seconds, Clock};

/// What a command line tool printed, and whether it exited successfully
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FetchError(pub String);

impl From<curl::Error> for FetchError {
    fn from(e: curl::Error) -> Self {
        FetchError(e.to_string())
    }
}

pub trait ProbeTools {
    /// Send one echo request to `address`, waiting at most `timeout_ms`
    fn ping(&self, address: &str, timeout_ms: u64) -> Result<ToolOutput, io::Error>;
    /// Look up `hostname`, on `resolver` if given, otherwise the network's resolver
    fn lookup(&self, hostname: &str, resolver: Option<&str>) -> Result<ToolOutput, io::Error>;
    /// GET `url`, returning the response body
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Ping exception, likely took longer than {timeout_ms} ms pinging {address}")]
    Timeout { address: String, timeout_ms: u64 },
    #[error("Could not execute '{tool}': {source}")]
    Tool {
        tool: &'static str,
        source: io::Error,
    },
    #[error("Got NXDOMAIN for a well-known domain '{0}'")]
    NxDomain(String),
    #[error("There was an unknown problem with DNS looking up '{host}': {detail}")]
    Dns { host: String, detail: String },
}

/// Uses the `ping` and `host` commands, and libcurl for the fetch
pub struct SystemTools;

// ping's -W is in milliseconds on macOS
#[cfg(target_os = "macos")]
fn ping_wait_arg(timeout_ms: u64) -> String {
    timeout_ms.to_string()
}

// and in whole seconds with iputils
#[cfg(not(target_os = "macos"))]
fn ping_wait_arg(timeout_ms: u64) -> String {
    timeout_ms.div_ceil(1000).max(1).to_string()
}

fn run(command: &mut Command) -> Result<ToolOutput, io::Error> {
    let output = command.output()?;
    Ok(ToolOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

impl ProbeTools for SystemTools {
    fn ping(&self, address: &str, timeout_ms: u64) -> Result<ToolOutput, io::Error> {
        run(Command::new("ping")
            .args(["-c", "1", "-n", "-W"])
            .arg(ping_wait_arg(timeout_ms))
            .arg(address))
    }

    fn lookup(&self, hostname: &str, resolver: Option<&str>) -> Result<ToolOutput, io::Error> {
        let mut command = Command::new("host");
        command.arg(hostname);
        if let Some(server) = resolver {
            command.arg(server);
        }
        run(&mut command)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut data = Vec::new();
        let mut easy = Easy::new();
        easy.url(url)?;
        easy.get(true)?;
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|new_data| {
                data.extend_from_slice(new_data);
                Ok(new_data.len())
            })?;
            transfer.perform()?;
        }
        Ok(data)
    }
}

/// Find the round trip time in a ping reply line such as
/// `64 bytes from 8.8.8.8: icmp_seq=0 ttl=117 time=23.4 ms`, rounded to whole milliseconds
fn parse_ping_time(data: &str) -> Option<i64> {
    data.lines().find_map(|line| {
        let (_, after) = line.split_once("time=")?;
        let value = after.split_whitespace().next()?.trim_end_matches("ms");
        value.parse::<f64>().ok().map(|ms| ms.round() as i64)
    })
}

fn all_lost(data: &str) -> bool {
    data.contains("100% packet loss") || data.contains("100.0% packet loss")
}

pub fn probe_latency(
    tools: &dyn ProbeTools,
    address: &str,
    timeout_ms: u64,
) -> Result<ProbeOutcome, ProbeError> {
    let output = tools
        .ping(address, timeout_ms)
        .map_err(|source| ProbeError::Tool {
            tool: "ping",
            source,
        })?;
    debug!("ping output:\n{}", output.stdout);

    if let Some(ms) = parse_ping_time(&output.stdout) {
        info!("Pinged {address} in {ms} ms");
        return Ok(ProbeOutcome::success(
            ProbeKind::Latency,
            ms,
            output.stdout.trim(),
        ));
    }

    if all_lost(&output.stdout) {
        warn!("100% packet loss from {address}");
        return Ok(ProbeOutcome::failure(
            ProbeKind::Latency,
            UNREACHABLE,
            output.stdout.trim(),
        ));
    }

    if !output.success {
        return Err(ProbeError::Timeout {
            address: address.to_owned(),
            timeout_ms,
        });
    }

    warn!("Unknown response when pinging {address}");
    Ok(ProbeOutcome::failure(
        ProbeKind::Latency,
        NO_TIMING,
        output.stdout.trim(),
    ))
}

pub fn probe_resolution(
    tools: &dyn ProbeTools,
    clock: &dyn Clock,
    host: &str,
    resolver: Option<&str>,
) -> Result<ProbeOutcome, ProbeError> {
    let start = clock.now();
    let output = tools
        .lookup(host, resolver)
        .map_err(|source| ProbeError::Tool {
            tool: "host",
            source,
        })?;
    let seconds = whole_seconds(start, clock.now());
    debug!("host output:\n{}", output.stdout);

    if output.stdout.contains("has address") {
        if seconds > 0 {
            warn!("DNS lookup of {host} took {seconds} seconds");
        } else {
            info!("DNS lookup of {host} took less than a second");
        }
        Ok(ProbeOutcome::success(
            ProbeKind::Resolution,
            seconds,
            output.stdout.trim(),
        ))
    } else if output.stdout.contains("NXDOMAIN") {
        Err(ProbeError::NxDomain(host.to_owned()))
    } else {
        Err(ProbeError::Dns {
            host: host.to_owned(),
            detail: output.stdout.trim().to_owned(),
        })
    }
}

/// Never fails: a transport error is recorded as [NO_TIMING], and a response that does not
/// look like a web page keeps its timing but is marked as not succeeded.
pub fn probe_fetch(tools: &dyn ProbeTools, clock: &dyn Clock, url: &str) -> ProbeOutcome {
    let start = clock.now();
    let result = tools.fetch(url);
    let seconds = whole_seconds(start, clock.now());

    match result {
        Ok(body) => {
            let content = String::from_utf8_lossy(&body);
            if content.to_lowercase().contains("html") {
                info!("Found 'html' in response from {url} after {seconds} seconds");
                ProbeOutcome::success(ProbeKind::Fetch, seconds, "found 'html' in response")
            } else {
                warn!("Response from {url} of {} bytes is not a web page", body.len());
                ProbeOutcome::failure(
                    ProbeKind::Fetch,
                    seconds,
                    format!("unexpected content, {} bytes", body.len()),
                )
            }
        }
        Err(e) => {
            warn!("Unable to fetch {url}: {e}");
            ProbeOutcome::failure(ProbeKind::Fetch, NO_TIMING, e.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io;

    use chrono::{DateTime, TimeZone, Utc};
    use data_model::{NO_TIMING, UNREACHABLE};

    use super::{
        parse_ping_time, probe_fetch, probe_latency, probe_resolution, FetchError, ProbeError,
        ProbeTools, ToolOutput,
    };
    use crate::clock::Clock;

    pub(crate) const PING_REPLY: &str = "PING 8.8.8.8 (8.8.8.8): 56 data bytes
64 bytes from 8.8.8.8: icmp_seq=0 ttl=117 time=23.1 ms

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 23.1/23.1/23.1/0.000 ms
";

    pub(crate) const PING_LOST: &str = "PING 8.8.8.8 (8.8.8.8): 56 data bytes

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 0 packets received, 100.0% packet loss
";

    pub(crate) const HOST_FOUND: &str = "google.com has address 142.250.178.14
google.com has IPv6 address 2a00:1450:4003:80e::200e
";

    pub(crate) const HOST_NXDOMAIN: &str = "Host nowhere.invalid not found: 3(NXDOMAIN)\n";

    /// Scripted tools, counting how often each was used
    pub(crate) struct FakeTools {
        pub ping: Result<ToolOutput, io::ErrorKind>,
        pub lookup: Result<ToolOutput, io::ErrorKind>,
        pub fetch: Result<Vec<u8>, String>,
        pub calls: Cell<usize>,
    }

    impl FakeTools {
        pub(crate) fn healthy() -> Self {
            FakeTools {
                ping: Ok(ToolOutput {
                    success: true,
                    stdout: PING_REPLY.into(),
                }),
                lookup: Ok(ToolOutput {
                    success: true,
                    stdout: HOST_FOUND.into(),
                }),
                fetch: Ok(b"<!DOCTYPE html><html><body>news</body></html>".to_vec()),
                calls: Cell::new(0),
            }
        }

        pub(crate) fn with_ping(stdout: &str, success: bool) -> Self {
            FakeTools {
                ping: Ok(ToolOutput {
                    success,
                    stdout: stdout.into(),
                }),
                ..Self::healthy()
            }
        }

        pub(crate) fn with_lookup(stdout: &str) -> Self {
            FakeTools {
                lookup: Ok(ToolOutput {
                    success: false,
                    stdout: stdout.into(),
                }),
                ..Self::healthy()
            }
        }
    }

    impl ProbeTools for FakeTools {
        fn ping(&self, _address: &str, _timeout_ms: u64) -> Result<ToolOutput, io::Error> {
            self.calls.set(self.calls.get() + 1);
            self.ping.clone().map_err(io::Error::from)
        }

        fn lookup(&self, _host: &str, _resolver: Option<&str>) -> Result<ToolOutput, io::Error> {
            self.calls.set(self.calls.get() + 1);
            self.lookup.clone().map_err(io::Error::from)
        }

        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.set(self.calls.get() + 1);
            self.fetch.clone().map_err(FetchError)
        }
    }

    /// Hands out the scripted instants in order, then keeps repeating the last one
    pub(crate) struct ScriptedClock(RefCell<VecDeque<DateTime<Utc>>>);

    impl ScriptedClock {
        pub(crate) fn new(seconds: &[i64]) -> Self {
            ScriptedClock(RefCell::new(
                seconds
                    .iter()
                    .map(|s| Utc.timestamp_opt(*s, 0).unwrap())
                    .collect(),
            ))
        }
    }

    impl Clock for ScriptedClock {
        fn now(&self) -> DateTime<Utc> {
            let mut instants = self.0.borrow_mut();
            if instants.len() > 1 {
                instants.pop_front().unwrap()
            } else {
                *instants.front().unwrap()
            }
        }
    }

    #[test]
    fn ping_time_parsed() {
        assert_eq!(parse_ping_time(PING_REPLY), Some(23));
        assert_eq!(
            parse_ping_time("64 bytes from 4.2.2.2: icmp_seq=1 ttl=57 time=9.87 ms"),
            Some(10)
        );
        assert_eq!(parse_ping_time(PING_LOST), None);
    }

    #[test]
    fn latency_success() {
        let outcome = probe_latency(&FakeTools::healthy(), "8.8.8.8", 10000).unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.elapsed, 23);
    }

    #[test]
    fn latency_all_lost_is_recorded() {
        let tools = FakeTools::with_ping(PING_LOST, false);
        let outcome = probe_latency(&tools, "8.8.8.8", 10000).unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.elapsed, UNREACHABLE);
    }

    #[test]
    fn latency_without_timing() {
        let tools = FakeTools::with_ping("PING 8.8.8.8 (8.8.8.8): 56 data bytes\n", true);
        let outcome = probe_latency(&tools, "8.8.8.8", 10000).unwrap();
        assert_eq!(outcome.elapsed, NO_TIMING);
    }

    #[test]
    fn latency_timeout_is_fatal() {
        let tools = FakeTools::with_ping("", false);
        match probe_latency(&tools, "8.8.8.8", 250) {
            Err(e @ ProbeError::Timeout { .. }) => assert!(e.to_string().contains("250 ms")),
            other => panic!("Expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn latency_tool_missing_is_fatal() {
        let tools = FakeTools {
            ping: Err(io::ErrorKind::NotFound),
            ..FakeTools::healthy()
        };
        assert!(matches!(
            probe_latency(&tools, "8.8.8.8", 10000),
            Err(ProbeError::Tool { tool: "ping", .. })
        ));
    }

    #[test]
    fn resolution_timed_in_seconds() {
        let clock = ScriptedClock::new(&[100, 102]);
        let outcome =
            probe_resolution(&FakeTools::healthy(), &clock, "google.com", None).unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.elapsed, 2);
    }

    #[test]
    fn resolution_nxdomain_is_fatal() {
        let clock = ScriptedClock::new(&[100]);
        let tools = FakeTools::with_lookup(HOST_NXDOMAIN);
        assert!(matches!(
            probe_resolution(&tools, &clock, "nowhere.invalid", None),
            Err(ProbeError::NxDomain(_))
        ));
    }

    #[test]
    fn resolution_unknown_is_fatal() {
        let clock = ScriptedClock::new(&[100]);
        let tools = FakeTools::with_lookup(";; connection timed out; no servers could be reached\n");
        assert!(matches!(
            probe_resolution(&tools, &clock, "google.com", Some("10.0.0.1")),
            Err(ProbeError::Dns { .. })
        ));
    }

    #[test]
    fn fetch_success() {
        let clock = ScriptedClock::new(&[100, 101]);
        let outcome = probe_fetch(&FakeTools::healthy(), &clock, "http://bbc.co.uk");
        assert!(outcome.succeeded);
        assert_eq!(outcome.elapsed, 1);
    }

    #[test]
    fn fetch_transport_error_is_soft() {
        let clock = ScriptedClock::new(&[100, 130]);
        let tools = FakeTools {
            fetch: Err("Couldn't resolve host name".into()),
            ..FakeTools::healthy()
        };
        let outcome = probe_fetch(&tools, &clock, "http://bbc.co.uk");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.elapsed, NO_TIMING);
        assert!(outcome.detail.contains("resolve"));
    }

    #[test]
    fn fetch_unexpected_content_keeps_timing() {
        let clock = ScriptedClock::new(&[100, 100]);
        let tools = FakeTools {
            fetch: Ok(Vec::new()),
            ..FakeTools::healthy()
        };
        let outcome = probe_fetch(&tools, &clock, "http://bbc.co.uk");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.elapsed, 0);
    }
}
