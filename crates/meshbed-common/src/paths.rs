//! Standard filesystem paths for meshbed.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default directory holding CNI plugin binaries.
pub static CNI_BIN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MESHBED_CNI_BIN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/opt/cni/bin"))
});

/// Default sidecar configuration file.
pub static SIDECAR_CONFIG: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MESHBED_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/meshbed/sidecar.toml"))
});

/// Standard paths used by the sidecar.
#[derive(Debug, Clone)]
pub struct MeshbedPaths {
    /// Directories searched for CNI plugins, in order.
    pub cni_bin_dirs: Vec<PathBuf>,
    /// Root of the proc filesystem (default: /proc).
    pub proc_root: PathBuf,
}

impl Default for MeshbedPaths {
    fn default() -> Self {
        Self {
            cni_bin_dirs: vec![CNI_BIN_DIR.clone()],
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl MeshbedPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom proc root.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Network namespace file of a process.
    #[must_use]
    pub fn netns_of_pid(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string()).join("ns").join("net")
    }

    /// Value for the `CNI_PATH` environment variable.
    #[must_use]
    pub fn cni_path_env(&self) -> String {
        std::env::join_paths(&self.cni_bin_dirs)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Find a plugin binary in the plugin directories.
    #[must_use]
    pub fn find_plugin(&self, plugin: &str) -> Option<PathBuf> {
        self.cni_bin_dirs
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| is_file(candidate))
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
