//! Configuration management

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::ca::{CaSettings, FileKeyStore, KeyAlgorithm};
use crate::identity::TrustDomain;
use crate::{Error, Result};

/// Environment variable prefix; nested keys use `__`, e.g. `CIPHER_CA__DIR`.
pub const ENV_PREFIX: &str = "CIPHER_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trust domain for every issued identity
    pub trust_domain: String,
    /// Root CA configuration
    pub ca: CaConfig,
    /// Service certificate configuration
    pub certificates: CertificatesConfig,
    /// Rotation configuration
    pub rotation: RotationConfig,
    /// Authorization rules
    pub policy: PolicyConfig,
    /// Audit log configuration
    pub audit: AuditConfig,
    /// Control API configuration
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust_domain: "cipher.local".to_string(),
            ca: CaConfig::default(),
            certificates: CertificatesConfig::default(),
            rotation: RotationConfig::default(),
            policy: PolicyConfig::default(),
            audit: AuditConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Root CA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Directory holding `root_ca.key` and `root_ca.crt`
    pub dir: PathBuf,
    /// Key algorithm for root and service keys
    pub key_algorithm: KeyAlgorithm,
    /// Root validity in days
    pub validity_days: u32,
    /// Root subject country
    pub country: String,
    /// Root subject organization
    pub organization: String,
    /// Root subject common name
    pub common_name: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/ca"),
            key_algorithm: KeyAlgorithm::default(),
            validity_days: 3650,
            country: "US".to_string(),
            organization: "Cipher".to_string(),
            common_name: "Cipher Root CA".to_string(),
        }
    }
}

/// Service certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificatesConfig {
    /// Base directory; each service gets `<dir>/<service>/`
    pub dir: PathBuf,
    /// Leaf validity in hours
    pub validity_hours: u32,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            validity_hours: 24,
        }
    }
}

/// Rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// How often each certificate is checked
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Authorization rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Ordered pairs allowed to communicate
    pub allow: Vec<AllowRuleConfig>,
}

/// One allowed `(source, destination)` pair, as SPIFFE URIs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRuleConfig {
    /// Calling identity
    pub source: String,
    /// Called identity
    pub destination: String,
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON Lines audit log
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/cipher_audit.jsonl"),
        }
    }
}

/// Control API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

impl ServerConfig {
    /// Parsed socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid server host '{}': {e}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Base URL a client on this host would use; an unspecified bind
    /// address is reached over loopback.
    pub fn base_url(&self) -> Result<String> {
        let mut addr = self.socket_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        Ok(format!("http://{addr}"))
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then `CIPHER_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.effective_trust_domain()?;
        Ok(config)
    }

    /// Validated trust domain
    pub fn effective_trust_domain(&self) -> Result<TrustDomain> {
        TrustDomain::new(self.trust_domain.as_str())
    }

    /// CA settings derived from this configuration
    pub fn ca_settings(&self) -> Result<CaSettings> {
        Ok(CaSettings {
            key_algorithm: self.ca.key_algorithm,
            root_validity_days: self.ca.validity_days,
            cert_validity_hours: self.certificates.validity_hours,
            country: self.ca.country.clone(),
            organization: self.ca.organization.clone(),
            common_name: self.ca.common_name.clone(),
            ..CaSettings::new(self.effective_trust_domain()?)
        })
    }

    /// Filesystem key store over the configured directories
    #[must_use]
    pub fn key_store(&self) -> FileKeyStore {
        FileKeyStore::new(&self.ca.dir, &self.certificates.dir)
    }

    /// Effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.trust_domain, "cipher.local");
        assert_eq!(config.ca.dir, PathBuf::from("data/ca"));
        assert_eq!(config.ca.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(config.ca.validity_days, 3650);
        assert_eq!(config.certificates.validity_hours, 24);
        assert_eq!(config.rotation.interval, Duration::from_secs(60));
        assert_eq!(config.audit.path, PathBuf::from("data/cipher_audit.jsonl"));
        assert_eq!(config.server.socket_addr().unwrap().port(), 9000);
        assert!(config.policy.allow.is_empty());
    }

    #[test]
    fn yaml_overrides_and_fills_defaults() {
        // GIVEN: a partial YAML document
        let yaml = r#"
trust_domain: prod.mesh
ca:
  key_algorithm: ed25519
rotation:
  interval: 5m
policy:
  allow:
    - source: spiffe://prod.mesh/service/a
      destination: spiffe://prod.mesh/service/b
"#;
        // WHEN
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        // THEN
        assert_eq!(config.trust_domain, "prod.mesh");
        assert_eq!(config.ca.key_algorithm, KeyAlgorithm::Ed25519);
        assert_eq!(config.ca.common_name, "Cipher Root CA");
        assert_eq!(config.rotation.interval, Duration::from_secs(300));
        assert_eq!(config.policy.allow.len(), 1);
        assert_eq!(config.policy.allow[0].destination, "spiffe://prod.mesh/service/b");
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cipher.yaml");
        std::fs::write(&path, "certificates:\n  validity_hours: 12\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.certificates.validity_hours, 12);
        assert_eq!(config.ca_settings().unwrap().cert_validity_hours, 12);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let result = Config::load(Some(Path::new("/nonexistent/cipher.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn load_rejects_invalid_trust_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cipher.yaml");
        std::fs::write(&path, "trust_domain: \"Not A Domain\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn ca_settings_carry_subject() {
        let mut config = Config::default();
        config.ca.organization = "Acme".to_string();
        let settings = config.ca_settings().unwrap();
        assert_eq!(settings.organization, "Acme");
        assert_eq!(settings.trust_domain.as_str(), "cipher.local");
    }

    #[test]
    fn key_store_uses_configured_dirs() {
        let config = Config::default();
        let store = config.key_store();
        assert_eq!(store.root_cert_path(), PathBuf::from("data/ca/root_ca.crt"));
        assert_eq!(
            store.service_cert_path("svc"),
            PathBuf::from("data/svc/svc.crt")
        );
    }

    #[test]
    fn base_url_targets_loopback_for_wildcard_bind() {
        let mut server = ServerConfig::default();
        assert_eq!(server.base_url().unwrap(), "http://127.0.0.1:9000");
        server.host = "0.0.0.0".to_string();
        server.port = 9000;
        assert_eq!(server.base_url().unwrap(), "http://127.0.0.1:9000");
        server.host = "::1".to_string();
        assert_eq!(server.base_url().unwrap(), "http://[::1]:9000");
    }

    #[test]
    fn bad_host_is_config_error() {
        let server = ServerConfig {
            host: "not-an-ip".to_string(),
            port: 1,
        };
        assert!(matches!(server.socket_addr(), Err(Error::Config(_))));
    }

    #[test]
    fn yaml_round_trip_of_defaults() {
        let yaml = Config::default().to_yaml().unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.rotation.interval, Duration::from_secs(60));
        assert_eq!(back.server.port, 9000);
    }
}
