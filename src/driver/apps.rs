//! App lifecycle: install (with simulator-compatibility preprocessing),
//! launch, terminate, uninstall, list.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{checked, HostDriver, ACTION_TIMEOUT, CREATE_TIMEOUT};
use crate::error::{Error, Result};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Bundle info extracted during install.
#[derive(Debug, Clone)]
pub struct InstalledAppInfo {
    pub bundle_id: String,
    pub app_name: String,
}

/// An app visible on the device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceApp {
    pub bundle_id: String,
    pub app_name: String,
    pub app_type: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct ListedApp {
    #[serde(rename = "CFBundleDisplayName")]
    display_name: Option<String>,
    #[serde(rename = "CFBundleName")]
    name: Option<String>,
    #[serde(rename = "ApplicationType")]
    app_type: Option<String>,
    #[serde(rename = "Path")]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoPlist {
    #[serde(rename = "CFBundleIdentifier")]
    bundle_id: Option<String>,
    #[serde(rename = "CFBundleDisplayName")]
    display_name: Option<String>,
    #[serde(rename = "CFBundleName")]
    name: Option<String>,
}

impl HostDriver {
    /// Install an app archive onto a device.
    ///
    /// The archive is expanded into a scratch directory and preprocessed for
    /// simulator compatibility: embedded code-signing blobs are stripped and
    /// the supported-platforms metadata is rewritten to include the simulator
    /// platform. The caller's file is never mutated; the scratch directory is
    /// removed on every path. If the modified bundle fails to install, the
    /// pristine bundle is tried once before giving up.
    pub async fn install_app(&self, udid: &str, archive: &Path) -> Result<InstalledAppInfo> {
        if !archive.exists() {
            return Err(Error::NotFound(format!(
                "archive {} does not exist",
                archive.display()
            )));
        }

        let scratch = tempfile::tempdir()?;
        let pristine_dir = scratch.path().join("pristine");
        let modified_dir = scratch.path().join("modified");
        std::fs::create_dir_all(&pristine_dir)?;

        self.extract_archive(archive, &pristine_dir).await?;
        let pristine_app = find_app_bundle(&pristine_dir)?;
        let info = self.read_bundle_info(&pristine_app).await?;

        // Work on a copy so the pristine bundle stays available for fallback.
        let out = self
            .run_tool(
                "cp",
                &[
                    "-R",
                    &pristine_app.to_string_lossy(),
                    &modified_dir.to_string_lossy(),
                ],
                ACTION_TIMEOUT,
            )
            .await?;
        checked(out, "copy app bundle")?;

        self.prepare_for_simulator(&modified_dir).await;

        let install = self
            .simctl(
                &["install", udid, &modified_dir.to_string_lossy()],
                INSTALL_TIMEOUT,
            )
            .await?;
        if install.success() {
            return Ok(info);
        }
        tracing::warn!(
            udid,
            bundle = %info.bundle_id,
            stderr = %install.stderr.trim(),
            "modified bundle install failed, retrying with pristine bundle"
        );

        let fallback = self
            .simctl(
                &["install", udid, &pristine_app.to_string_lossy()],
                INSTALL_TIMEOUT,
            )
            .await?;
        checked(fallback, "simctl install")?;
        Ok(info)
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<()> {
        let out = self
            .run_tool(
                "ditto",
                &[
                    "-x",
                    "-k",
                    &archive.to_string_lossy(),
                    &dest.to_string_lossy(),
                ],
                CREATE_TIMEOUT,
            )
            .await?;
        if out.success() {
            return Ok(());
        }
        Err(Error::HostDriver(format!(
            "archive expansion failed: {}",
            out.stderr.trim()
        )))
    }

    async fn read_bundle_info(&self, app_bundle: &Path) -> Result<InstalledAppInfo> {
        let plist = app_bundle.join("Info.plist");
        if !plist.exists() {
            return Err(Error::HostDriver(
                "invalid archive: app bundle has no Info.plist".to_string(),
            ));
        }
        let out = self
            .run_tool(
                "plutil",
                &["-convert", "json", "-o", "-", &plist.to_string_lossy()],
                ACTION_TIMEOUT,
            )
            .await?;
        let out = checked(out, "plutil convert")?;
        let parsed: InfoPlist = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::HostDriver(format!("unparseable Info.plist: {}", e)))?;
        let bundle_id = parsed
            .bundle_id
            .ok_or_else(|| Error::HostDriver("Info.plist has no CFBundleIdentifier".into()))?;
        let app_name = parsed
            .display_name
            .or(parsed.name)
            .unwrap_or_else(|| bundle_id.clone());
        Ok(InstalledAppInfo {
            bundle_id,
            app_name,
        })
    }

    /// Strip signing artifacts and rewrite platform metadata in place.
    /// Failures here are non-fatal; the install attempt decides the outcome.
    async fn prepare_for_simulator(&self, app_bundle: &Path) {
        let _ = std::fs::remove_dir_all(app_bundle.join("_CodeSignature"));
        let _ = std::fs::remove_file(app_bundle.join("embedded.mobileprovision"));
        let _ = std::fs::remove_file(app_bundle.join("Embedded.mobileprovision"));
        let _ = std::fs::remove_file(app_bundle.join("Entitlements.plist"));

        let plist = app_bundle.join("Info.plist");
        let _ = self
            .run_tool(
                "plutil",
                &[
                    "-replace",
                    "CFBundleSupportedPlatforms",
                    "-json",
                    "[\"iPhoneSimulator\"]",
                    &plist.to_string_lossy(),
                ],
                ACTION_TIMEOUT,
            )
            .await;

        let bundle = app_bundle.to_string_lossy();
        let _ = self
            .run_tool(
                "codesign",
                &["--remove-signature", &bundle],
                ACTION_TIMEOUT,
            )
            .await;
        let _ = self
            .run_tool(
                "codesign",
                &["--force", "--sign", "-", "--deep", &bundle],
                ACTION_TIMEOUT,
            )
            .await;
    }

    /// Launch an installed app and return its PID.
    pub async fn launch_app(&self, udid: &str, bundle_id: &str) -> Result<u32> {
        let out = self
            .simctl(&["launch", udid, bundle_id], ACTION_TIMEOUT)
            .await?;
        if !out.success() {
            let stderr = out.stderr.to_lowercase();
            if stderr.contains("not installed") || stderr.contains("no such") {
                return Err(Error::NotFound(format!(
                    "app {} is not installed",
                    bundle_id
                )));
            }
            return Err(Error::HostDriver(format!(
                "launch failed: {}",
                out.stderr.trim()
            )));
        }
        // simctl prints "<bundle-id>: <pid>"
        let pid = out
            .stdout
            .rsplit(':')
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        Ok(pid)
    }

    /// Terminate a running app.
    pub async fn terminate_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        let out = self
            .simctl(&["terminate", udid, bundle_id], ACTION_TIMEOUT)
            .await?;
        checked(out, "simctl terminate").map(|_| ())
    }

    /// Uninstall an app; tolerant of it already being gone.
    pub async fn uninstall_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        let out = self
            .simctl(&["uninstall", udid, bundle_id], ACTION_TIMEOUT)
            .await?;
        if out.success() {
            return Ok(());
        }
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("not installed") || stderr.contains("not found") {
            return Ok(());
        }
        Err(Error::HostDriver(format!(
            "uninstall failed: {}",
            out.stderr.trim()
        )))
    }

    /// List apps visible on the device. `simctl listapps` emits an old-style
    /// plist, so the output is piped through `plutil` for JSON.
    pub async fn list_apps(&self, udid: &str) -> Result<Vec<DeviceApp>> {
        let pipeline = format!(
            "xcrun simctl listapps '{}' | plutil -convert json -o - -- -",
            udid
        );
        let out = self
            .run_tool("sh", &["-c", &pipeline], ACTION_TIMEOUT)
            .await?;
        let out = checked(out, "simctl listapps")?;
        let parsed: HashMap<String, ListedApp> = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::HostDriver(format!("unparseable app list: {}", e)))?;
        let mut apps: Vec<DeviceApp> = parsed
            .into_iter()
            .map(|(bundle_id, info)| DeviceApp {
                app_name: info
                    .display_name
                    .or(info.name)
                    .unwrap_or_else(|| bundle_id.clone()),
                bundle_id,
                app_type: info.app_type.unwrap_or_else(|| "Unknown".to_string()),
                path: info.path.unwrap_or_default(),
            })
            .collect();
        apps.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
        Ok(apps)
    }
}

fn find_app_bundle(extracted: &Path) -> Result<PathBuf> {
    let payload = extracted.join("Payload");
    let search_dir = if payload.is_dir() { payload } else { extracted.to_path_buf() };
    for entry in std::fs::read_dir(&search_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "app") {
            return Ok(path);
        }
    }
    Err(Error::HostDriver(
        "invalid archive: no .app bundle found".to_string(),
    ))
}
