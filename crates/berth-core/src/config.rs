//! berth.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub audit_git: AuditGitConfig,
    #[serde(default)]
    pub compile: CompileConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8090 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of all persisted control-plane state; doubles as the working
    /// tree of the audit repository.
    pub work_dir: PathBuf,
    /// Lowest port handed out to workload containers.
    pub min_port: u16,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/berth"),
            min_port: 10000,
        }
    }
}

/// Remote and identity of the control plane's own audit repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditGitConfig {
    pub repository_url: String,
    pub username: String,
    pub password: String,
    pub identity_name: String,
    pub identity_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// External compiler binary; invoked with the source directory as its
    /// single argument, exit code 0 meaning success.
    pub command: String,
    pub pool_size: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            command: "dataapp-compiler".to_string(),
            pool_size: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub pool_size: usize,
    /// Seconds to let a freshly started container settle before it is
    /// considered RUNNING.
    pub settle_delay_secs: u64,
    /// Grace period passed to the engine when stopping a container.
    pub stop_grace_secs: i64,
    /// Path of the compiled artifact inside a workload's source tree.
    pub artifact_path: PathBuf,
    pub http_proxy: String,
    pub https_proxy: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            settle_delay_secs: 15,
            stop_grace_secs: 10,
            artifact_path: PathBuf::from("generated/target/app.jar"),
            http_proxy: String::new(),
            https_proxy: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Base URL under which workload containers are reachable; the
    /// allocated port and `/process` are appended per dispatch.
    pub machine_url: String,
    pub http_proxy_host: String,
    pub http_proxy_port: u16,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            machine_url: "http://localhost".to_string(),
            http_proxy_host: String::new(),
            http_proxy_port: 80,
        }
    }
}

impl BerthConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: BerthConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.paths.min_port, 10000);
        assert_eq!(config.compile.pool_size, 2);
        assert_eq!(config.docker.settle_delay_secs, 15);
        assert_eq!(config.dispatch.machine_url, "http://localhost");
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: BerthConfig = toml::from_str(
            r#"
[server]
port = 9000

[audit_git]
repository_url = "https://example.com/audit.git"
username = "svc"
password = "pw"
identity_name = "berth"
identity_email = "berth@example.com"

[docker]
pool_size = 8
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.audit_git.identity_name, "berth");
        // Partially specified section: explicit value plus defaults.
        assert_eq!(config.docker.pool_size, 8);
        assert_eq!(config.docker.settle_delay_secs, 15);
        // Untouched section keeps its defaults.
        assert_eq!(config.compile.command, "dataapp-compiler");
    }
}
