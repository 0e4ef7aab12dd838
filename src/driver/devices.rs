//! Simulator device lifecycle via `xcrun simctl`.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{checked, HostDriver, ACTION_TIMEOUT, CREATE_TIMEOUT};
use crate::error::{Error, Result};

/// The host's view of a simulator device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub udid: String,
    pub name: String,
    pub runtime: String,
    pub state: DeviceState,
    pub is_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Shutdown,
    Booting,
    Booted,
    ShuttingDown,
    Unknown,
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "shutdown" => DeviceState::Shutdown,
            "booting" => DeviceState::Booting,
            "booted" => DeviceState::Booted,
            "shutting down" => DeviceState::ShuttingDown,
            _ => DeviceState::Unknown,
        }
    }
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Shutdown => "Shutdown",
            DeviceState::Booting => "Booting",
            DeviceState::Booted => "Booted",
            DeviceState::ShuttingDown => "Shutting Down",
            DeviceState::Unknown => "Unknown",
        }
    }
}

/// Logical point and pixel dimensions of a device screen.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDimensions {
    pub point_width: u32,
    pub point_height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub scale_factor: u32,
}

// JSON shapes of `simctl list ... -j`.

#[derive(Debug, Deserialize)]
struct SimctlDeviceList {
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
struct SimctlDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(rename = "isAvailable")]
    is_available: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SimctlDeviceTypes {
    devicetypes: Vec<SimctlDeviceType>,
}

#[derive(Debug, Deserialize)]
struct SimctlDeviceType {
    name: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct SimctlRuntimes {
    runtimes: Vec<SimctlRuntime>,
}

#[derive(Debug, Deserialize)]
struct SimctlRuntime {
    name: String,
    identifier: String,
    #[serde(rename = "isAvailable")]
    is_available: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct IdbDescribe {
    screen_dimensions: Option<IdbScreenDimensions>,
}

#[derive(Debug, Deserialize)]
struct IdbScreenDimensions {
    width: u32,
    height: u32,
    width_points: u32,
    height_points: u32,
}

/// "com.apple.CoreSimulator.SimRuntime.iOS-17-2" -> "iOS 17.2"
pub(crate) fn parse_runtime_name(identifier: &str) -> String {
    if let Some(suffix) = identifier.strip_prefix("com.apple.CoreSimulator.SimRuntime.") {
        if let Some((os_name, version)) = suffix.split_once('-') {
            format!("{} {}", os_name, version.replace('-', "."))
        } else {
            suffix.to_string()
        }
    } else {
        identifier.to_string()
    }
}

impl HostDriver {
    /// Enumerate all devices known to the host, grouped state flattened.
    pub async fn list_devices(&self) -> Result<Vec<SimDevice>> {
        let out = self
            .simctl_retry(&["list", "devices", "-j"], ACTION_TIMEOUT)
            .await?;
        let out = checked(out, "simctl list devices")?;
        let parsed: SimctlDeviceList = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::HostDriver(format!("unparseable simctl device list: {}", e)))?;

        let mut devices = Vec::new();
        for (runtime_key, entries) in parsed.devices {
            let runtime = parse_runtime_name(&runtime_key);
            for d in entries {
                devices.push(SimDevice {
                    udid: d.udid,
                    name: d.name,
                    runtime: runtime.clone(),
                    state: DeviceState::from(d.state.as_str()),
                    is_available: d.is_available.unwrap_or(true),
                });
            }
        }
        Ok(devices)
    }

    /// Devices currently in the `Booted` state.
    pub async fn list_booted(&self) -> Result<Vec<SimDevice>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.state == DeviceState::Booted)
            .collect())
    }

    /// Look up a single device by UDID.
    pub async fn find_device(&self, udid: &str) -> Result<Option<SimDevice>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.udid == udid))
    }

    /// Available iPhone/iPad device types: display name -> identifier.
    pub async fn device_types(&self) -> Result<BTreeMap<String, String>> {
        let out = self
            .simctl_retry(&["list", "devicetypes", "-j"], ACTION_TIMEOUT)
            .await?;
        let out = checked(out, "simctl list devicetypes")?;
        let parsed: SimctlDeviceTypes = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::HostDriver(format!("unparseable device types: {}", e)))?;
        Ok(parsed
            .devicetypes
            .into_iter()
            .filter(|t| t.name.contains("iPhone") || t.name.contains("iPad"))
            .map(|t| (t.name, t.identifier))
            .collect())
    }

    /// Available iOS runtimes: version string -> identifier.
    pub async fn runtimes(&self) -> Result<BTreeMap<String, String>> {
        let out = self
            .simctl_retry(&["list", "runtimes", "-j"], ACTION_TIMEOUT)
            .await?;
        let out = checked(out, "simctl list runtimes")?;
        let parsed: SimctlRuntimes = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::HostDriver(format!("unparseable runtimes: {}", e)))?;
        Ok(parsed
            .runtimes
            .into_iter()
            .filter(|r| r.is_available.unwrap_or(false) && r.name.contains("iOS"))
            .map(|r| (r.name.replace("iOS ", ""), r.identifier))
            .collect())
    }

    /// Create a new device and return its UDID.
    pub async fn create_device(
        &self,
        name: &str,
        device_type_id: &str,
        runtime_id: &str,
    ) -> Result<String> {
        let out = self
            .simctl(&["create", name, device_type_id, runtime_id], CREATE_TIMEOUT)
            .await?;
        let out = checked(out, "simctl create")?;
        let udid = out.stdout.trim().to_string();
        if udid.is_empty() {
            return Err(Error::HostDriver(
                "simctl create produced no UDID".to_string(),
            ));
        }
        Ok(udid)
    }

    /// Boot a device and wait for it to reach the `Booted` state.
    ///
    /// "Unable to boot device in current state: Booted" is not an error.
    pub async fn boot(&self, udid: &str) -> Result<()> {
        let out = self.simctl(&["boot", udid], CREATE_TIMEOUT).await?;
        if !out.success() && !out.stderr.contains("Booted") {
            return Err(Error::HostDriver(format!(
                "simctl boot failed: {}",
                out.stderr.trim()
            )));
        }
        self.wait_for_boot(udid, CREATE_TIMEOUT).await?;

        // Bring up the Simulator UI so the host renders the device window.
        let _ = self
            .run_tool(
                "open",
                &["-a", "Simulator", "--args", "-CurrentDeviceUDID", udid],
                ACTION_TIMEOUT,
            )
            .await;
        Ok(())
    }

    async fn wait_for_boot(&self, udid: &str, max_wait: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let poll = Duration::from_millis(500);
        while start.elapsed() < max_wait {
            if let Some(device) = self.find_device(udid).await? {
                if device.state == DeviceState::Booted {
                    return Ok(());
                }
            }
            tokio::time::sleep(poll).await;
        }
        Err(Error::Timeout(format!("device {} did not boot", udid)))
    }

    /// Shut down a device; tolerant of it already being shut down.
    pub async fn shutdown(&self, udid: &str) -> Result<()> {
        let out = self.simctl(&["shutdown", udid], ACTION_TIMEOUT).await?;
        if !out.success() && !out.stderr.contains("Shutdown") {
            return Err(Error::HostDriver(format!(
                "simctl shutdown failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Erase a device's contents.
    pub async fn erase(&self, udid: &str) -> Result<()> {
        let out = self.simctl(&["erase", udid], ACTION_TIMEOUT).await?;
        checked(out, "simctl erase").map(|_| ())
    }

    /// Delete a device from the host.
    pub async fn delete_device(&self, udid: &str) -> Result<()> {
        let out = self.simctl(&["delete", udid], ACTION_TIMEOUT).await?;
        checked(out, "simctl delete").map(|_| ())
    }

    /// PID of the running simulator process for a device, if any.
    pub async fn simulator_pid(&self, udid: &str) -> Option<u32> {
        let pattern = format!("CurrentDeviceUDID {}", udid);
        let out = self
            .run_tool("pgrep", &["-f", &pattern], ACTION_TIMEOUT)
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        out.stdout.lines().next()?.trim().parse().ok()
    }

    /// Query point and pixel dimensions for a booted device.
    ///
    /// Falls back to iPhone-class defaults (390x844 points at 3x) if the
    /// description tool is unavailable; dimensions are advisory for clients,
    /// not load-bearing for capture.
    pub async fn device_dimensions(&self, udid: &str) -> DeviceDimensions {
        if let Ok(out) = self
            .idb(&["describe", "--udid", udid, "--json"], ACTION_TIMEOUT)
            .await
        {
            if out.success() {
                if let Ok(parsed) = serde_json::from_str::<IdbDescribe>(&out.stdout) {
                    if let Some(dims) = parsed.screen_dimensions {
                        if dims.width_points > 0 && dims.height_points > 0 {
                            let scale = (dims.width / dims.width_points.max(1)).clamp(1, 3);
                            return DeviceDimensions {
                                point_width: dims.width_points,
                                point_height: dims.height_points,
                                pixel_width: dims.width,
                                pixel_height: dims.height,
                                scale_factor: scale,
                            };
                        }
                    }
                }
            }
        }
        DeviceDimensions {
            point_width: 390,
            point_height: 844,
            pixel_width: 1170,
            pixel_height: 2532,
            scale_factor: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_name_parsing() {
        assert_eq!(
            parse_runtime_name("com.apple.CoreSimulator.SimRuntime.iOS-17-2"),
            "iOS 17.2"
        );
        assert_eq!(
            parse_runtime_name("com.apple.CoreSimulator.SimRuntime.iOS-16-0"),
            "iOS 16.0"
        );
        assert_eq!(parse_runtime_name("custom-runtime"), "custom-runtime");
    }

    #[test]
    fn device_state_from_str() {
        assert_eq!(DeviceState::from("Booted"), DeviceState::Booted);
        assert_eq!(DeviceState::from("shutdown"), DeviceState::Shutdown);
        assert_eq!(DeviceState::from("Shutting Down"), DeviceState::ShuttingDown);
        assert_eq!(DeviceState::from("???"), DeviceState::Unknown);
    }

    #[test]
    fn parse_simctl_device_list() {
        let json = r#"{
            "devices": {
                "com.apple.CoreSimulator.SimRuntime.iOS-17-0": [
                    {
                        "udid": "ABC-123",
                        "name": "iPhone 15 Pro",
                        "state": "Booted",
                        "isAvailable": true
                    },
                    {
                        "udid": "DEF-456",
                        "name": "iPad Air",
                        "state": "Shutdown",
                        "isAvailable": false
                    }
                ]
            }
        }"#;
        let parsed: SimctlDeviceList = serde_json::from_str(json).unwrap();
        let entries = &parsed.devices["com.apple.CoreSimulator.SimRuntime.iOS-17-0"];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].udid, "ABC-123");
        assert_eq!(entries[1].is_available, Some(false));
    }

    #[test]
    fn parse_device_types_filters_nothing_at_json_level() {
        let json = r#"{
            "devicetypes": [
                {"name": "iPhone 15 Pro", "identifier": "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro"},
                {"name": "Apple Watch Ultra", "identifier": "com.apple.CoreSimulator.SimDeviceType.Watch-Ultra"}
            ]
        }"#;
        let parsed: SimctlDeviceTypes = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.devicetypes.len(), 2);
    }

    #[test]
    fn parse_idb_describe_dimensions() {
        let json = r#"{
            "screen_dimensions": {
                "width": 1179, "height": 2556,
                "density": 3.0,
                "width_points": 393, "height_points": 852
            }
        }"#;
        let parsed: IdbDescribe = serde_json::from_str(json).unwrap();
        let dims = parsed.screen_dimensions.unwrap();
        assert_eq!(dims.width_points, 393);
        assert_eq!(dims.width / dims.width_points, 3);
    }
}
