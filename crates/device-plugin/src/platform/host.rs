use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;

use super::PlatformError;
use super::PlatformInfo;
use super::TegraDevice;
use super::NVML_LIBRARY;

const TEGRA_RELEASE_FILE: &str = "etc/nv_tegra_release";
const SOC_FAMILY_FILE: &str = "sys/devices/soc0/family";
const TEGRA_DEVICE_NODES: [&str; 4] = [
    "dev/nvhost-ctrl",
    "dev/nvhost-ctrl-gpu",
    "dev/nvhost-gpu",
    "dev/nvmap",
];

/// Probes the running host: the dynamic loader for NVML and well known files
/// for Tegra.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    root: PathBuf,
    nvml_library: String,
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostPlatform {
    /// Probe the filesystem below `root` instead of `/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            nvml_library: NVML_LIBRARY.to_string(),
        }
    }

    pub fn with_nvml_library(mut self, library: impl Into<String>) -> Self {
        self.nvml_library = library.into();
        self
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

impl PlatformInfo for HostPlatform {
    fn has_nvml(&self) -> (bool, String) {
        // SAFETY: loading NVML runs no initialization beyond the library's own constructors
        match unsafe { libloading::Library::new(&self.nvml_library) } {
            Ok(_) => (true, format!("found NVML library {}", self.nvml_library)),
            Err(e) => (
                false,
                format!("could not load NVML library {}: {e}", self.nvml_library),
            ),
        }
    }

    fn is_tegra_system(&self) -> (bool, String) {
        let release = self.path(TEGRA_RELEASE_FILE);
        if release.exists() {
            return (true, format!("{} found", release.display()));
        }

        let family = self.path(SOC_FAMILY_FILE);
        match std::fs::read_to_string(&family) {
            Ok(content) if content.trim().to_ascii_lowercase().starts_with("tegra") => (
                true,
                format!("{} has value {}", family.display(), content.trim()),
            ),
            Ok(content) => (
                false,
                format!("{} has value {}", family.display(), content.trim()),
            ),
            Err(_) => (
                false,
                format!(
                    "neither {} nor {} found",
                    release.display(),
                    family.display()
                ),
            ),
        }
    }

    fn tegra_devices(&self) -> Result<Vec<TegraDevice>, Report<PlatformError>> {
        let paths: Vec<String> = TEGRA_DEVICE_NODES
            .iter()
            .map(|node| self.path(node))
            .filter(|path| path.exists())
            .map(|path| device_node_path(&self.root, &path))
            .collect();

        if paths.is_empty() {
            tracing::debug!("No Tegra device nodes found");
            return Ok(Vec::new());
        }

        Ok(vec![TegraDevice {
            name: tegra_name(&self.path(SOC_FAMILY_FILE)),
            paths,
        }])
    }
}

/// Device nodes are reported as they appear on the real host, not below the
/// probe root.
fn device_node_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    Path::new("/").join(relative).to_string_lossy().into_owned()
}

fn tegra_name(family: &Path) -> String {
    std::fs::read_to_string(family)
        .map(|content| content.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "tegra".to_string())
}
