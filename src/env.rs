//! Environment constants and path utilities for envd.
//!
//! Centralizes the fixed names, label keys and default values shared by the
//! spec builder, the host adapters and the command line.

use std::path::{Path, PathBuf};

/// Application directory name in the user's home directory
pub const ENVD_DIR_NAME: &str = ".envd";

/// Configuration file name within [`ENVD_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "envd.toml";

/// Fixed values describing the development environment container.
pub mod container {
    /// Home directory prefix the build context is mounted under
    pub const HOME_PREFIX: &str = "/home/envd";

    /// User the environment runs as
    pub const USER: &str = "envd";

    /// Host IP every port binding is attached to
    pub const LOCALHOST: &str = "127.0.0.1";

    /// sshd port inside the container
    pub const SSH_PORT: u16 = 2222;

    /// Jupyter port inside the container
    pub const JUPYTER_PORT: u16 = 8888;

    /// RStudio server port inside the container
    pub const RSTUDIO_PORT: u16 = 8787;

    /// Default buildkitd image
    pub const BUILDKITD_IMAGE: &str = "docker.io/moby/buildkit:v0.10.3";

    /// Readiness polling interval in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 1000;

    /// Default readiness timeout in seconds
    pub const READY_TIMEOUT_SECS: u64 = 60;
}

/// Label keys persisted on environment containers.
pub mod labels {
    /// Marks containers managed by envd; used as the listing filter
    pub const MANAGED: &str = "ai.tensorchord.envd.managed";

    /// Environment name
    pub const NAME: &str = "ai.tensorchord.envd.name";

    /// Whether GPU devices were requested
    pub const GPU: &str = "ai.tensorchord.envd.gpu";

    /// Host port bound to sshd
    pub const SSH_PORT: &str = "ai.tensorchord.envd.ssh.port";

    /// Host port bound to jupyter
    pub const JUPYTER_PORT: &str = "ai.tensorchord.envd.jupyter.port";

    /// Host port bound to the rstudio server
    pub const RSTUDIO_PORT: &str = "ai.tensorchord.envd.rstudio.server.port";
}

/// GPU device request values.
pub mod gpu {
    /// Device driver
    pub const DRIVER: &str = "nvidia";

    /// Capabilities requested from the driver, each its own capability set
    pub const CAPABILITIES: [&str; 8] = [
        "gpu", "nvidia", "compute", "compat32", "graphics", "utility", "video", "display",
    ];

    /// Runtime name reported by the daemon when the NVIDIA toolkit is installed
    pub const RUNTIME: &str = "nvidia";
}

/// Build the user config directory path
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(ENVD_DIR_NAME)
}

/// Build the user config file path
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build the local config file path in the given directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.envd/config.toml")
        );
        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/envd.toml")
        );
    }

    #[test]
    fn test_gpu_capabilities_are_distinct() {
        let mut caps = gpu::CAPABILITIES.to_vec();
        caps.sort_unstable();
        caps.dedup();
        assert_eq!(caps.len(), 8);
    }
}
