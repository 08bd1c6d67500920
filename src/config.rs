use crate::{CirrusError, Result, hostname::HostName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from `~/.cirrus.toml` unless overridden
/// on the command line. One `[env.<site>]` table per control-plane
/// environment, keyed by the site token of the VM FQDN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CirrusConfig {
    #[serde(default)]
    pub env: HashMap<String, EnvConfig>,
    /// Hypervisor-agent version -> default disk image format. Policy data,
    /// deliberately kept out of code: the known entries are only defaults.
    #[serde(default = "default_formats")]
    pub formats: HashMap<String, String>,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub waits: WaitConfig,
    /// Command to run on the guest once it is reachable after migration
    /// (configuration-management handoff). Skipped when unset.
    #[serde(default)]
    pub post_boot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret: String,
    pub zone: String,
    pub account: String,
    pub domain: String,
    /// Network name used when deploying under a new identity.
    #[serde(default = "default_network")]
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Key used from the operator machine towards compute hosts and guests.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Key present on the compute hosts for host-to-host rsync.
    #[serde(default = "default_transfer_key")]
    pub transfer_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Directory on the compute hosts holding the VM disk images.
    #[serde(default = "default_image_dir")]
    pub directory: String,
}

/// Polling intervals and deadlines for the wait loops. The reference
/// tooling polled without any timeout; the deadlines here are a deliberate
/// deviation so a wedged control plane cannot hang a migration forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_job_poll")]
    pub job_poll_secs: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Grace period after destroying the source VM, so the control plane
    /// can expunge it before its identity is reused.
    #[serde(default = "default_expunge_grace")]
    pub expunge_grace_secs: u64,
}

fn default_formats() -> HashMap<String, String> {
    HashMap::from([
        ("4.4.2".to_string(), "raw".to_string()),
        ("4.9.3.0".to_string(), "qcow2".to_string()),
    ])
}

fn default_network() -> String {
    "Application".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_transfer_key() -> String {
    "/root/.ssh/id_rsa_compute".to_string()
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_image_dir() -> String {
    "/var/lib/libvirt/images".to_string()
}

fn default_job_poll() -> u64 {
    5
}

fn default_job_timeout() -> u64 {
    1800
}

fn default_probe_interval() -> u64 {
    1
}

fn default_probe_timeout() -> u64 {
    900
}

fn default_expunge_grace() -> u64 {
    60
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_path: None,
            transfer_key: default_transfer_key(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            directory: default_image_dir(),
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            job_poll_secs: default_job_poll(),
            job_timeout_secs: default_job_timeout(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            expunge_grace_secs: default_expunge_grace(),
        }
    }
}

impl CirrusConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CirrusError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: CirrusConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cirrus.toml")
    }

    /// Select the environment section for a VM by its FQDN site token.
    pub fn env_for(&self, host: &HostName) -> Result<&EnvConfig> {
        let site = host.site();
        if site.is_empty() {
            return Err(CirrusError::ConfigError(format!(
                "cannot identify a control-plane environment from '{}'",
                host.fqdn()
            )));
        }
        self.env.get(site).ok_or_else(|| {
            CirrusError::ConfigError(format!("no [env.{}] section in configuration", site))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[env.sea]
api_url = "https://cloud.sea.example.com/client/api"
api_key = "key"
secret = "secret"
zone = "sea-zone-1"
account = "ops"
domain = "ROOT"

[waits]
job_poll_secs = 1
"#;

    #[test]
    fn parses_with_defaults() {
        let config: CirrusConfig = toml::from_str(SAMPLE).expect("parse config");
        let env = config.env.get("sea").expect("sea env");
        assert_eq!(env.zone, "sea-zone-1");
        assert_eq!(env.network, "Application");
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.image.directory, "/var/lib/libvirt/images");
        assert_eq!(config.waits.job_poll_secs, 1);
        assert_eq!(config.waits.expunge_grace_secs, 60);
    }

    #[test]
    fn format_table_defaults_carry_known_agents() {
        let config: CirrusConfig = toml::from_str(SAMPLE).expect("parse config");
        assert_eq!(config.formats.get("4.4.2").map(String::as_str), Some("raw"));
        assert_eq!(
            config.formats.get("4.9.3.0").map(String::as_str),
            Some("qcow2")
        );
    }

    #[test]
    fn from_file_reads_a_config_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cirrus.toml");
        std::fs::write(&path, SAMPLE).expect("write config");
        let config = CirrusConfig::from_file(&path).expect("load config");
        assert!(config.env.contains_key("sea"));

        assert!(matches!(
            CirrusConfig::from_file(&dir.path().join("missing.toml")),
            Err(CirrusError::ConfigError(_))
        ));
    }

    #[test]
    fn env_selection_follows_site_token() {
        let config: CirrusConfig = toml::from_str(SAMPLE).expect("parse config");
        let host = HostName::new("web01.example.sea");
        assert!(config.env_for(&host).is_ok());

        let unknown = HostName::new("web01.example.fkb");
        assert!(matches!(
            config.env_for(&unknown),
            Err(CirrusError::ConfigError(_))
        ));
    }
}
