//! Installed application discovery and launch.
//!
//! Linux reads XDG desktop entries and launches through `gtk-launch`.
//! macOS lists `.app` bundles and launches through `open`.

use super::{AppLauncher, InstalledApp, ServiceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Launcher for the current desktop.
#[derive(Debug, Clone)]
pub struct DesktopAppLauncher {
    search_dirs: Vec<PathBuf>,
}

impl DesktopAppLauncher {
    /// Launcher searching the platform's standard application directories.
    pub fn new() -> Self {
        Self {
            search_dirs: default_search_dirs(),
        }
    }

    /// Launcher searching only `dirs`.
    pub fn with_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }
}

impl Default for DesktopAppLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
fn default_search_dirs() -> Vec<PathBuf> {
    let mut found = vec![PathBuf::from("/Applications")];
    if let Some(home) = dirs::home_dir() {
        found.push(home.join("Applications"));
    }
    found
}

#[cfg(not(target_os = "macos"))]
fn default_search_dirs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Some(data) = dirs::data_dir() {
        found.push(data.join("applications"));
    }
    let system = std::env::var("XDG_DATA_DIRS")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());
    found.extend(
        system
            .split(':')
            .filter(|d| !d.is_empty())
            .map(|d| Path::new(d).join("applications")),
    );
    found
}

#[async_trait]
impl AppLauncher for DesktopAppLauncher {
    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>, ServiceError> {
        let dirs = self.search_dirs.clone();
        let apps = tokio::task::spawn_blocking(move || scan_dirs(&dirs))
            .await
            .map_err(|e| ServiceError::Unavailable(format!("app scan failed: {e}")))?;
        debug!("Found {} installed apps", apps.len());
        Ok(apps)
    }

    async fn launch(&self, package_id: &str) -> Result<(), ServiceError> {
        let mut command = launch_command(package_id);
        info!("Launching app: {}", package_id);

        let status = command
            .status()
            .await
            .map_err(|e| ServiceError::Launch(format!("{package_id}: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(ServiceError::Launch(format!(
                "{} exited with {}",
                package_id, status
            )))
        }
    }
}

#[cfg(target_os = "macos")]
fn launch_command(package_id: &str) -> Command {
    let mut command = Command::new("open");
    command.arg("-a").arg(package_id);
    command
}

#[cfg(not(target_os = "macos"))]
fn launch_command(package_id: &str) -> Command {
    let mut command = Command::new("gtk-launch");
    command.arg(package_id);
    command
}

fn scan_dirs(dirs: &[PathBuf]) -> Vec<InstalledApp> {
    let mut apps: Vec<InstalledApp> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let app = match path.extension().and_then(|e| e.to_str()) {
                Some("desktop") => read_desktop_entry(&path),
                Some("app") => bundle_app(&path),
                _ => None,
            };
            // Earlier directories shadow later ones.
            if let Some(app) = app {
                if !apps.iter().any(|a| a.package_id == app.package_id) {
                    apps.push(app);
                }
            }
        }
    }

    apps.sort_by(|a, b| a.name.cmp(&b.name));
    apps
}

fn bundle_app(path: &Path) -> Option<InstalledApp> {
    let name = path.file_stem()?.to_str()?.to_string();
    Some(InstalledApp {
        name,
        package_id: path.to_string_lossy().into_owned(),
    })
}

fn read_desktop_entry(path: &Path) -> Option<InstalledApp> {
    let contents = std::fs::read_to_string(path).ok()?;
    let id = path.file_stem()?.to_str()?.to_string();
    parse_desktop_entry(&id, &contents)
}

/// Parse the `[Desktop Entry]` group of a desktop file.
fn parse_desktop_entry(id: &str, contents: &str) -> Option<InstalledApp> {
    let mut in_entry = false;
    let mut name = None;

    for line in contents.lines().map(str::trim) {
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match (key.trim(), value.trim()) {
            ("Name", value) => name = Some(value.to_string()),
            ("NoDisplay" | "Hidden", "true") => return None,
            ("Type", kind) if kind != "Application" => return None,
            _ => {}
        }
    }

    name.map(|name| InstalledApp {
        name,
        package_id: id.to_string(),
    })
}

/// Find an app by partial, case-insensitive name.
///
/// Exact matches win over partial ones.
pub fn find_app<'a>(apps: &'a [InstalledApp], query: &str) -> Option<&'a InstalledApp> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }

    apps.iter()
        .find(|a| a.name.to_lowercase() == query)
        .or_else(|| {
            apps.iter().find(|a| {
                let name = a.name.to_lowercase();
                name.contains(&query) || query.contains(&name)
            })
        })
}
