use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cert::KeySettings;
use crate::error::{Error, Result};

/// Cluster properties a provisioning run is generated from.
///
/// Read from TOML:
///
/// ```toml
/// master_hostname = "cluster-master-0"
/// external_master_hostname = "cluster.example.com"
/// master_ips = ["10.0.0.1"]
/// cluster_username = "admin"
/// cluster_password = "secret"
///
/// [azure]
/// tenant_id = "..."
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterProperties {
    pub master_hostname: String,
    #[serde(default)]
    pub external_master_hostname: Option<String>,
    pub master_ips: Vec<IpAddr>,
    #[serde(default = "master_port")]
    pub port: u16,
    #[serde(default)]
    pub cluster_username: String,
    #[serde(default)]
    pub cluster_password: String,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub pki: PkiConfig,
}

/// Cloud provider settings rendered into azure.conf.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AzureConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub aad_client_id: String,
    #[serde(default)]
    pub aad_client_secret: String,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PkiConfig {
    #[serde(default = "ca_key_size")]
    pub ca_key_size: u32,
    #[serde(default = "cert_key_size")]
    pub key_size: u32,
    #[serde(default = "ca_validity_days")]
    pub ca_validity_days: u32,
    #[serde(default = "validity_days")]
    pub validity_days: u32,
}

impl Default for PkiConfig {
    fn default() -> Self {
        PkiConfig {
            ca_key_size: ca_key_size(),
            key_size: cert_key_size(),
            ca_validity_days: ca_validity_days(),
            validity_days: validity_days(),
        }
    }
}

impl From<&PkiConfig> for KeySettings {
    fn from(pki: &PkiConfig) -> Self {
        KeySettings {
            ca_key_size: pki.ca_key_size,
            key_size: pki.key_size,
            ca_validity_days: pki.ca_validity_days,
            validity_days: pki.validity_days,
        }
    }
}

const MIN_KEY_SIZE: u32 = 2048;

impl ClusterProperties {
    /// Minimal properties for a master reachable at `hostname`/`ip`.
    pub fn new(hostname: impl Into<String>, ip: IpAddr) -> Self {
        ClusterProperties {
            master_hostname: hostname.into(),
            external_master_hostname: None,
            master_ips: vec![ip],
            port: master_port(),
            cluster_username: String::new(),
            cluster_password: String::new(),
            azure: AzureConfig::default(),
            pki: PkiConfig::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Self> {
        let props: ClusterProperties = toml::from_str(contents).map_err(|e| Error::Config {
            path: path.to_owned(),
            reason: e.message().to_string(),
        })?;
        props.validate().map_err(|reason| Error::Config {
            path: path.to_owned(),
            reason,
        })?;
        Ok(props)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.master_hostname.trim().is_empty() {
            return Err("master_hostname must not be empty".to_string());
        }
        if self.master_ips.is_empty() {
            return Err("master_ips must contain at least one address".to_string());
        }
        if self.pki.ca_key_size < MIN_KEY_SIZE || self.pki.key_size < MIN_KEY_SIZE {
            return Err(format!("key sizes below {} bits are not allowed", MIN_KEY_SIZE));
        }
        Ok(())
    }

    /// Hostname clients outside the cluster use; falls back to the master hostname.
    pub fn external_hostname(&self) -> &str {
        self.external_master_hostname
            .as_deref()
            .unwrap_or(&self.master_hostname)
    }

    pub fn key_settings(&self) -> KeySettings {
        KeySettings::from(&self.pki)
    }

    pub fn internal_endpoint(&self) -> String {
        format!("https://{}:{}", self.master_hostname, self.port)
    }

    pub fn external_endpoint(&self) -> String {
        format!("https://{}:{}", self.external_hostname(), self.port)
    }
}

fn master_port() -> u16 {
    8443
}

fn ca_key_size() -> u32 {
    4096
}

fn cert_key_size() -> u32 {
    2048
}

fn ca_validity_days() -> u32 {
    1825
}

fn validity_days() -> u32 {
    730
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
master_hostname = "cluster-master-0"
external_master_hostname = "cluster.westus2.cloudapp.azure.com"
master_ips = ["10.0.0.1"]
cluster_username = "admin"
cluster_password = "hunter2"

[azure]
tenant_id = "tenant"
subscription_id = "subscription"
aad_client_id = "client"
aad_client_secret = "client-secret"
resource_group = "rg"
location = "westus2"

[pki]
ca_key_size = 2048
"#;

    #[test]
    fn parses_full_properties_with_defaults() {
        let props = ClusterProperties::parse(Path::new("cluster.toml"), FULL).unwrap();

        assert_eq!(props.master_hostname, "cluster-master-0");
        assert_eq!(props.master_ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(props.port, 8443);
        assert_eq!(props.azure.location, "westus2");
        assert_eq!(props.pki.ca_key_size, 2048);
        assert_eq!(props.pki.key_size, 2048);
        assert_eq!(props.pki.validity_days, 730);
        assert_eq!(props.internal_endpoint(), "https://cluster-master-0:8443");
        assert_eq!(
            props.external_endpoint(),
            "https://cluster.westus2.cloudapp.azure.com:8443"
        );
    }

    #[test]
    fn external_hostname_defaults_to_master() {
        let props = ClusterProperties::new("cluster-master-0", "10.0.0.1".parse().unwrap());
        assert_eq!(props.external_hostname(), "cluster-master-0");
    }

    #[test]
    fn rejects_missing_ips() {
        let err = ClusterProperties::parse(
            Path::new("cluster.toml"),
            "master_hostname = \"m\"\nmaster_ips = []\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { reason, .. } if reason.contains("master_ips")));
    }

    #[test]
    fn rejects_invalid_ip_literal() {
        let err = ClusterProperties::parse(
            Path::new("cluster.toml"),
            "master_hostname = \"m\"\nmaster_ips = [\"10.0.0.300\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn rejects_weak_keys() {
        let err = ClusterProperties::parse(
            Path::new("cluster.toml"),
            "master_hostname = \"m\"\nmaster_ips = [\"10.0.0.1\"]\n[pki]\nkey_size = 1024\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let props = ClusterProperties::from_file(file.path()).unwrap();
        assert_eq!(props.cluster_username, "admin");

        let missing = ClusterProperties::from_file(Path::new("/nonexistent/cluster.toml"));
        assert!(matches!(missing, Err(Error::Config { .. })));
    }
}
