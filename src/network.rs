//! Joining and leaving the card's Wi-Fi network.
//!
//! The card is its own access point, so a sync usually means: associate
//! with it, mirror, then drop the association so the host goes back to its
//! normal network. The state of that association lives in a [`Session`]
//! handed back to the caller instead of on any shared object.

use std::process::Command;
use std::thread;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// An established link to the card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Interface that was switched to the card's network.
    pub interface: Option<String>,
    /// Network the interface joined; `None` when nothing was changed.
    pub network: Option<String>,
}

pub trait NetworkLink: Send + Sync {
    fn connect(&self) -> Result<Session>;
    fn disconnect(&self, session: Session) -> Result<()>;
}

/// For hosts that are already on the card's network.
#[derive(Debug, Default)]
pub struct NoopLink;

impl NetworkLink for NoopLink {
    fn connect(&self) -> Result<Session> {
        Ok(Session::default())
    }

    fn disconnect(&self, _session: Session) -> Result<()> {
        Ok(())
    }
}

/// macOS `networksetup` driven link.
pub struct NetworkSetupLink {
    pub ssid: String,
    pub psk: String,
    pub retries: u32,
    pub connection_delay: Duration,
}

impl std::fmt::Debug for NetworkSetupLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSetupLink")
            .field("ssid", &self.ssid)
            .field("psk", &"<redacted>")
            .field("retries", &self.retries)
            .field("connection_delay", &self.connection_delay)
            .finish()
    }
}

fn networksetup(args: &[&str]) -> Command {
    let mut cmd = Command::new("networksetup");
    cmd.args(args);
    cmd
}

/// Run a command and return its stdout; non-zero exit is an error.
fn run_output(cmd: &mut Command, description: &str) -> Result<String> {
    let output = cmd
        .output()
        .map_err(|e| SyncError::Network(format!("failed to run {description}: {e}")))?;
    if !output.status.success() {
        return Err(SyncError::Network(format!(
            "{description} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Device name of the `Wi-Fi` hardware port in
/// `networksetup -listallhardwareports` output.
pub fn find_wifi_device(ports: &str) -> Option<String> {
    let mut lines = ports.lines();
    while let Some(line) = lines.next() {
        if line.contains("Wi-Fi") {
            let device = lines.next()?;
            let (_, name) = device.split_once(':')?;
            let name = name.trim();
            return (!name.is_empty()).then(|| name.to_string());
        }
    }
    None
}

/// `networksetup` reports association failures on stdout with exit code 0.
fn association_failed(stdout: &str) -> bool {
    stdout.contains("Failed") || stdout.contains("Could not find network")
}

impl NetworkSetupLink {
    fn associate(&self, interface: &str) -> Result<()> {
        let out = run_output(
            &mut networksetup(&["-setairportnetwork", interface, &self.ssid, &self.psk]),
            &format!("joining {}", self.ssid),
        )?;
        if association_failed(&out) {
            return Err(SyncError::Network(format!(
                "Error connecting to {}: {}",
                self.ssid,
                out.trim()
            )));
        }
        Ok(())
    }
}

impl NetworkLink for NetworkSetupLink {
    fn connect(&self) -> Result<Session> {
        let ports = run_output(
            &mut networksetup(&["-listallhardwareports"]),
            "listing hardware ports",
        )?;
        let interface = find_wifi_device(&ports)
            .ok_or_else(|| SyncError::Network("No Wi-Fi interface found".into()))?;

        let attempts = self.retries.max(1);
        for attempt in 1..=attempts {
            tracing::info!(ssid = %self.ssid, interface = %interface, attempt, "joining card network");
            match self.associate(&interface) {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    tracing::warn!(error = %e, "join failed, retrying in {:?}", self.connection_delay);
                    thread::sleep(self.connection_delay);
                }
                Err(e) => return Err(e),
            }
        }

        // the card needs a moment to hand out an address
        thread::sleep(self.connection_delay);

        Ok(Session {
            interface: Some(interface),
            network: Some(self.ssid.clone()),
        })
    }

    fn disconnect(&self, session: Session) -> Result<()> {
        let (Some(interface), Some(network)) = (session.interface, session.network) else {
            return Ok(());
        };

        tracing::info!(network = %network, "removing network profile");
        run_output(
            &mut networksetup(&["-removepreferredwirelessnetwork", &interface, &network]),
            &format!("removing profile for {network}"),
        )?;

        run_output(
            &mut networksetup(&["-setairportpower", &interface, "off"]),
            "turning Wi-Fi off",
        )?;
        tracing::info!(interface = %interface, "Wi-Fi interface turned off");
        run_output(
            &mut networksetup(&["-setairportpower", &interface, "on"]),
            "turning Wi-Fi on",
        )?;
        tracing::info!(interface = %interface, "Wi-Fi interface turned on");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORTS: &str = "\
Hardware Port: Ethernet
Device: en1
Ethernet Address: 00:11:22:33:44:55

Hardware Port: Wi-Fi
Device: en0
Ethernet Address: 66:77:88:99:aa:bb

VLAN Configurations
===================
";

    #[test]
    fn finds_wifi_device() {
        assert_eq!(find_wifi_device(PORTS).as_deref(), Some("en0"));
    }

    #[test]
    fn no_wifi_port() {
        assert_eq!(find_wifi_device("Hardware Port: Ethernet\nDevice: en1\n"), None);
        assert_eq!(find_wifi_device("Hardware Port: Wi-Fi\n"), None);
    }

    #[test]
    fn detects_failed_association() {
        assert!(association_failed(
            "Failed to join network ez Share.\nError: -3900  The operation couldn't be completed."
        ));
        assert!(!association_failed(""));
    }

    #[test]
    fn noop_link_round_trip() {
        let link = NoopLink;
        let session = link.connect().unwrap();
        assert_eq!(session, Session::default());
        link.disconnect(session).unwrap();
    }

    #[test]
    fn disconnect_without_network_is_a_no_op() {
        let link = NetworkSetupLink {
            ssid: "ez Share".into(),
            psk: "88888888".into(),
            retries: 1,
            connection_delay: Duration::ZERO,
        };
        link.disconnect(Session::default()).unwrap();
        assert!(!format!("{link:?}").contains("88888888"));
    }
}
