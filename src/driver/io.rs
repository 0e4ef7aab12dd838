//! Device interaction: input gestures, screenshots, file transfer, URLs,
//! location, orientation, media, and log streaming.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use super::{checked, HostDriver, ACTION_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::DeviceButton;

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(2);
const TAP_TIMEOUT: Duration = Duration::from_secs(2);
const SWIPE_TIMEOUT: Duration = Duration::from_secs(3);
const TEXT_TIMEOUT: Duration = Duration::from_secs(5);

/// A process visible on the device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceProcess {
    pub process: String,
    pub pid: u32,
}

impl HostDriver {
    /// Capture a PNG screenshot of the device.
    pub async fn screenshot(&self, udid: &str) -> Result<Vec<u8>> {
        let scratch = tempfile::tempdir()?;
        let path = scratch.path().join("shot.png");
        let path_str = path.to_string_lossy().to_string();
        let out = self
            .simctl(
                &["io", udid, "screenshot", "--type=png", &path_str],
                SCREENSHOT_TIMEOUT,
            )
            .await?;
        checked(out, "simctl screenshot")?;
        let bytes = std::fs::read(&path)?;
        if bytes.is_empty() {
            return Err(Error::HostDriver("screenshot produced no data".into()));
        }
        Ok(bytes)
    }

    /// Tap at logical point coordinates.
    pub async fn tap(&self, udid: &str, x: f64, y: f64) -> Result<()> {
        let (xs, ys) = (format_coord(x), format_coord(y));
        let out = self
            .idb(&["ui", "tap", &xs, &ys, "--udid", udid], TAP_TIMEOUT)
            .await?;
        checked(out, "idb tap").map(|_| ())
    }

    /// Swipe between two points over an optional duration (seconds).
    pub async fn swipe(
        &self,
        udid: &str,
        start_x: f64,
        start_y: f64,
        end_x: f64,
        end_y: f64,
        duration: Option<f64>,
    ) -> Result<()> {
        let (sx, sy) = (format_coord(start_x), format_coord(start_y));
        let (ex, ey) = (format_coord(end_x), format_coord(end_y));
        let dur = format!("{}", duration.unwrap_or(0.2));
        let out = self
            .idb(
                &[
                    "ui", "swipe", &sx, &sy, &ex, &ey, "--duration", &dur, "--udid", udid,
                ],
                SWIPE_TIMEOUT,
            )
            .await?;
        checked(out, "idb swipe").map(|_| ())
    }

    /// Press a hardware button.
    pub async fn press_button(&self, udid: &str, button: DeviceButton) -> Result<()> {
        let out = self
            .idb(
                &["ui", "button", button.tool_name(), "--udid", udid],
                TAP_TIMEOUT,
            )
            .await?;
        checked(out, "idb button").map(|_| ())
    }

    /// Press a single key by HID usage code, optionally held for a duration.
    pub async fn key(&self, udid: &str, key: &str, duration: Option<f64>) -> Result<()> {
        let mut args = vec!["ui", "key", key];
        let dur;
        if let Some(d) = duration {
            dur = format!("{}", d);
            args.push("--duration");
            args.push(&dur);
        }
        args.push("--udid");
        args.push(udid);
        let out = self.idb(&args, TAP_TIMEOUT).await?;
        checked(out, "idb key").map(|_| ())
    }

    /// Type a text string.
    pub async fn input_text(&self, udid: &str, text: &str) -> Result<()> {
        let out = self
            .idb(&["ui", "text", text, "--udid", udid], TEXT_TIMEOUT)
            .await?;
        checked(out, "idb text").map(|_| ())
    }

    /// Open a URL on the device.
    pub async fn open_url(&self, udid: &str, url: &str) -> Result<()> {
        let out = self.simctl(&["openurl", udid, url], ACTION_TIMEOUT).await?;
        checked(out, "simctl openurl").map(|_| ())
    }

    /// Simulate a GPS position.
    pub async fn set_location(&self, udid: &str, latitude: f64, longitude: f64) -> Result<()> {
        let coords = format!("{},{}", latitude, longitude);
        let out = self
            .simctl(&["location", udid, "set", &coords], ACTION_TIMEOUT)
            .await?;
        checked(out, "simctl location set").map(|_| ())
    }

    /// Stop simulating a GPS position.
    pub async fn clear_location(&self, udid: &str) -> Result<()> {
        let out = self
            .simctl(&["location", udid, "clear"], ACTION_TIMEOUT)
            .await?;
        checked(out, "simctl location clear").map(|_| ())
    }

    /// Rotate the device.
    pub async fn set_orientation(&self, udid: &str, orientation: &str) -> Result<()> {
        let out = self
            .simctl(&["ui", udid, "orientation", orientation], ACTION_TIMEOUT)
            .await?;
        checked(out, "simctl orientation").map(|_| ())
    }

    /// Add photos or videos to the device's media library.
    pub async fn add_media(&self, udid: &str, paths: &[PathBuf]) -> Result<usize> {
        let mut added = 0usize;
        for path in paths {
            if !path.exists() {
                return Err(Error::NotFound(format!("media {} missing", path.display())));
            }
            let path_str = path.to_string_lossy().to_string();
            let out = self
                .simctl(&["addmedia", udid, &path_str], ACTION_TIMEOUT)
                .await?;
            checked(out, "simctl addmedia")?;
            added += 1;
        }
        Ok(added)
    }

    /// Push a file to the device filesystem or an app container.
    ///
    /// The simulator's filesystem is host-visible, so pushes are host-side
    /// copies into the device data directory.
    pub async fn push_file(
        &self,
        udid: &str,
        local: &Path,
        device_path: &str,
        bundle_id: Option<&str>,
    ) -> Result<PathBuf> {
        if !local.exists() {
            return Err(Error::NotFound(format!(
                "local file {} missing",
                local.display()
            )));
        }
        let dest = self
            .resolve_device_path(udid, device_path, bundle_id)
            .await?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, &dest)?;
        Ok(dest)
    }

    /// Pull a file from the device filesystem or an app container.
    pub async fn pull_file(
        &self,
        udid: &str,
        device_path: &str,
        bundle_id: Option<&str>,
    ) -> Result<Vec<u8>> {
        let source = self
            .resolve_device_path(udid, device_path, bundle_id)
            .await?;
        if !source.exists() {
            return Err(Error::NotFound(format!(
                "device file {} missing",
                device_path
            )));
        }
        Ok(std::fs::read(&source)?)
    }

    async fn resolve_device_path(
        &self,
        udid: &str,
        device_path: &str,
        bundle_id: Option<&str>,
    ) -> Result<PathBuf> {
        let relative = device_path.trim_start_matches('/');
        match bundle_id {
            Some(bundle) => {
                let container = self.app_container(udid, bundle).await?;
                Ok(container.join(relative))
            }
            None => {
                let home = std::env::var("HOME")
                    .map_err(|_| Error::Internal("HOME is not set".into()))?;
                Ok(PathBuf::from(home)
                    .join("Library/Developer/CoreSimulator/Devices")
                    .join(udid)
                    .join("data")
                    .join(relative))
            }
        }
    }

    /// Resolve an app's data container path.
    pub async fn app_container(&self, udid: &str, bundle_id: &str) -> Result<PathBuf> {
        let out = self
            .simctl(
                &["get_app_container", udid, bundle_id, "data"],
                ACTION_TIMEOUT,
            )
            .await?;
        if !out.success() {
            return Err(Error::NotFound(format!(
                "no container for app {}",
                bundle_id
            )));
        }
        Ok(PathBuf::from(out.stdout.trim()))
    }

    /// Processes running inside the device.
    pub async fn list_processes(&self, udid: &str) -> Result<Vec<DeviceProcess>> {
        let out = self
            .simctl(&["spawn", udid, "launchctl", "list"], ACTION_TIMEOUT)
            .await?;
        let out = checked(out, "simctl spawn launchctl list")?;
        Ok(parse_launchctl_list(&out.stdout))
    }

    /// Erase the device's log archive.
    pub async fn clear_logs(&self, udid: &str) -> Result<()> {
        let out = self
            .simctl(&["spawn", udid, "log", "erase", "--all"], ACTION_TIMEOUT)
            .await?;
        checked(out, "simctl log erase").map(|_| ())
    }

    /// Spawn a streaming log child. The caller owns the child and must reap
    /// it; stdout is piped line-by-line.
    pub fn spawn_log_stream(&self, udid: &str) -> Result<tokio::process::Child> {
        tokio::process::Command::new("xcrun")
            .args([
                "simctl", "spawn", udid, "log", "stream", "--style", "compact", "--color",
                "none", "--level", "debug",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::HostDriver(format!("failed to spawn log stream: {}", e)))
    }
}

fn format_coord(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.1}", value)
    }
}

fn parse_launchctl_list(output: &str) -> Vec<DeviceProcess> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let pid: u32 = cols.next()?.parse().ok()?;
            let _status = cols.next()?;
            let label = cols.next()?;
            Some(DeviceProcess {
                process: label.to_string(),
                pid,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_format_as_integers_when_whole() {
        assert_eq!(format_coord(100.0), "100");
        assert_eq!(format_coord(99.5), "99.5");
    }

    #[test]
    fn launchctl_output_parses_pids() {
        let output = "PID\tStatus\tLabel\n\
                      431\t0\tcom.apple.SpringBoard\n\
                      -\t0\tcom.apple.idle\n\
                      502\t0\tcom.example.demo\n";
        let procs = parse_launchctl_list(output);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 431);
        assert_eq!(procs[0].process, "com.apple.SpringBoard");
        assert_eq!(procs[1].process, "com.example.demo");
    }

    #[test]
    fn launchctl_empty_output() {
        assert!(parse_launchctl_list("").is_empty());
    }
}
