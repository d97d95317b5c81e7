use std::io;
use std::process::Command;

use log::{debug, warn};

/// Source of the platform's description of the current wireless association
pub trait Association {
    fn current_association(&self) -> Result<String, io::Error>;
}

pub struct PlatformAssociation;

#[cfg(target_os = "macos")]
impl Association for PlatformAssociation {
    fn current_association(&self) -> Result<String, io::Error> {
        let output = Command::new("/usr/sbin/networksetup")
            .arg("-getairportnetwork")
            .arg("en0")
            .output()
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;

        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}", String::from_utf8_lossy(&output.stderr)),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// This will need improving for the case when there are multiple interfaces
#[cfg(not(target_os = "macos"))]
impl Association for PlatformAssociation {
    fn current_association(&self) -> Result<String, io::Error> {
        let output = Command::new("iw")
            .arg("dev")
            .output()
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "Could not execute 'iw'"))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Prefixes of the lines naming the associated SSID, in `iw dev`, `airport -I` and
/// `networksetup -getairportnetwork` output respectively
const SSID_MARKERS: [&str; 3] = ["ssid ", "SSID: ", "Current Wi-Fi Network: "];

fn associated_ssids(data: &str) -> impl Iterator<Item = &str> {
    data.lines().filter_map(|line| {
        let line = line.trim();
        SSID_MARKERS
            .iter()
            .find_map(|marker| line.strip_prefix(marker))
            .map(str::trim)
    })
}

/// True if the host is currently associated with `expected_ssid`. Failing to find out is
/// treated the same as being somewhere else.
pub fn is_on_expected_network(association: &dyn Association, expected_ssid: &str) -> bool {
    let data = match association.current_association() {
        Ok(data) => data,
        Err(e) => {
            warn!("Could not get current wifi association: '{e}'");
            return false;
        }
    };
    debug!("Current association:\n{data}");

    let found = associated_ssids(&data).any(|ssid| ssid == expected_ssid);
    found
}

#[cfg(test)]
mod test {
    use std::io;

    use super::{is_on_expected_network, Association};

    struct Reports(Result<&'static str, ()>);

    impl Association for Reports {
        fn current_association(&self) -> Result<String, io::Error> {
            self.0
                .map(str::to_owned)
                .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "no wifi"))
        }
    }

    const IW_DEV: &str = "phy#0
\tInterface wlp2s0
\t\tifindex 3
\t\twdev 0x1
\t\taddr 3c:a9:f4:00:00:00
\t\tssid HomeNet
\t\ttype managed
";

    #[test]
    fn linux_association() {
        assert!(is_on_expected_network(&Reports(Ok(IW_DEV)), "HomeNet"));
    }

    #[test]
    fn macos_association() {
        let data = "Current Wi-Fi Network: Home Net\n";
        assert!(is_on_expected_network(&Reports(Ok(data)), "Home Net"));
    }

    #[test]
    fn airport_association() {
        let data = "     agrCtlRSSI: -52\n          BSSID: 0:0:0:0:0:0\n           SSID: HomeNet\n";
        assert!(is_on_expected_network(&Reports(Ok(data)), "HomeNet"));
    }

    #[test]
    fn other_network() {
        assert!(!is_on_expected_network(&Reports(Ok(IW_DEV)), "Office"));
    }

    #[test]
    fn prefix_of_other_network() {
        let data = IW_DEV.replace("HomeNet", "HomeNet-Guest");
        let reports = Reports(Ok(Box::leak(data.into_boxed_str())));
        assert!(!is_on_expected_network(&reports, "HomeNet"));
    }

    #[test]
    fn not_associated() {
        assert!(!is_on_expected_network(&Reports(Ok("")), "HomeNet"));
    }

    #[test]
    fn query_failure() {
        assert!(!is_on_expected_network(&Reports(Err(())), "HomeNet"));
    }
}
