//! TOML-based configuration system for margin.

use crate::error::{MarginError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level margin configuration, deserialized from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginConfig {
    pub margin: MarginSection,
    #[serde(default)]
    pub h: HConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub blackboard: VendorOAuthConfig,
    #[serde(default)]
    pub d2l: VendorOAuthConfig,
    #[serde(default)]
    pub jstor: JstorConfig,
    #[serde(default)]
    pub vitalsource: VitalSourceConfig,
}

/// Core instance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginSection {
    pub instance_name: String,
    pub data_dir: String,
    /// Externally reachable base URL, used for OAuth redirect URIs and the
    /// LTI 1.3 tool JWKS.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Hex-encoded AES-256 key file used to encrypt tenant secrets at rest.
    #[serde(default)]
    pub master_key_path: Option<String>,
    /// PEM RSA private key used to sign LTI Advantage client assertions.
    #[serde(default)]
    pub signing_key_path: Option<String>,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Some("/var/lib/margin/margin.db".into()),
        }
    }
}

/// Annotation service ("h") integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HConfig {
    #[serde(default = "default_h_api_url")]
    pub api_url: String,
    #[serde(default = "default_h_authority")]
    pub authority: String,
    /// Basic-auth credentials for the service's admin API.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Credentials for minting client grant tokens.
    #[serde(default)]
    pub jwt_client_id: String,
    #[serde(default)]
    pub jwt_client_secret: String,
    #[serde(default = "default_via_url")]
    pub via_url: String,
    #[serde(default)]
    pub via_secret: String,
}

impl Default for HConfig {
    fn default() -> Self {
        Self {
            api_url: default_h_api_url(),
            authority: default_h_authority(),
            client_id: String::new(),
            client_secret: String::new(),
            jwt_client_id: String::new(),
            jwt_client_secret: String::new(),
            via_url: default_via_url(),
            via_secret: String::new(),
        }
    }
}

fn default_h_api_url() -> String {
    "https://hypothes.is/api/".into()
}

fn default_h_authority() -> String {
    "lms.hypothes.is".into()
}

fn default_via_url() -> String {
    "https://via.hypothes.is/".into()
}

/// Launch verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Allowed difference between `oauth_timestamp` and server time.
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_secs: u64,
    /// How long a seen nonce is remembered.
    #[serde(default = "default_nonce_window")]
    pub nonce_window_secs: u64,
    /// How long a fetched platform key set is cached.
    #[serde(default = "default_key_set_ttl")]
    pub key_set_ttl_secs: u64,
    /// Lifetime of the internal bearer token handed to the frontend.
    #[serde(default = "default_bearer_lifetime")]
    pub bearer_lifetime_secs: u64,
    /// Clock leeway when validating LTI 1.3 `exp`/`iat`.
    #[serde(default = "default_jwt_leeway")]
    pub jwt_leeway_secs: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: default_timestamp_tolerance(),
            nonce_window_secs: default_nonce_window(),
            key_set_ttl_secs: default_key_set_ttl(),
            bearer_lifetime_secs: default_bearer_lifetime(),
            jwt_leeway_secs: default_jwt_leeway(),
        }
    }
}

fn default_timestamp_tolerance() -> u64 {
    300
}

fn default_nonce_window() -> u64 {
    // Long enough to cover both sides of the timestamp tolerance.
    600
}

fn default_key_set_ttl() -> u64 {
    3600
}

fn default_bearer_lifetime() -> u64 {
    24 * 60 * 60
}

fn default_jwt_leeway() -> u64 {
    60
}

/// Outbound HTTP timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_h_timeout")]
    pub h_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            refresh_timeout_secs: default_refresh_timeout(),
            h_timeout_secs: default_h_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    10
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_h_timeout() -> u64 {
    10
}

/// Installation-wide OAuth client credentials for a vendor REST API.
///
/// Canvas developer keys are per tenant and live on the application instance
/// instead.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VendorOAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl VendorOAuthConfig {
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

/// JSTOR content source settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JstorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// VitalSource content source settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VitalSourceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl MarginConfig {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MarginError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Validate the configuration, returning an error for invalid combinations.
    pub fn validate(&self) -> Result<()> {
        if self.margin.instance_name.is_empty() {
            return Err(MarginError::Config(
                "margin.instance_name must not be empty".into(),
            ));
        }

        if self.margin.data_dir.is_empty() {
            return Err(MarginError::Config(
                "margin.data_dir must not be empty".into(),
            ));
        }

        if self.margin.database.path.is_none() {
            return Err(MarginError::Config(
                "margin.database.path is required".into(),
            ));
        }

        if self.h.authority.is_empty() {
            return Err(MarginError::Config("h.authority must not be empty".into()));
        }

        if url::Url::parse(&self.h.api_url).is_err() {
            return Err(MarginError::Config(format!(
                "h.api_url is not a valid URL: {}",
                self.h.api_url
            )));
        }

        if self.launch.timestamp_tolerance_secs == 0 {
            return Err(MarginError::Config(
                "launch.timestamp_tolerance_secs must be greater than zero".into(),
            ));
        }

        // A nonce must outlive the window in which its timestamp is accepted,
        // otherwise a replay just after expiry would pass.
        if self.launch.nonce_window_secs < self.launch.timestamp_tolerance_secs {
            return Err(MarginError::Config(
                "launch.nonce_window_secs must be at least launch.timestamp_tolerance_secs"
                    .into(),
            ));
        }

        if self.jstor.enabled && (self.jstor.api_url.is_none() || self.jstor.secret.is_none()) {
            return Err(MarginError::Config(
                "jstor.api_url and jstor.secret are required when JSTOR is enabled".into(),
            ));
        }

        if self.vitalsource.enabled && self.vitalsource.api_key.is_none() {
            return Err(MarginError::Config(
                "vitalsource.api_key is required when VitalSource is enabled".into(),
            ));
        }

        if (self.blackboard.is_configured() || self.d2l.is_configured())
            && self.margin.public_url.is_none()
        {
            return Err(MarginError::Config(
                "margin.public_url is required for vendor OAuth redirects".into(),
            ));
        }

        Ok(())
    }

    /// Generate a sensible default configuration.
    pub fn generate_default() -> Self {
        Self {
            margin: MarginSection {
                instance_name: "margin".into(),
                data_dir: "/var/lib/margin".into(),
                public_url: None,
                database: DatabaseConfig::default(),
                master_key_path: None,
                signing_key_path: None,
            },
            h: HConfig::default(),
            launch: LaunchConfig::default(),
            http: HttpConfig::default(),
            blackboard: VendorOAuthConfig::default(),
            d2l: VendorOAuthConfig::default(),
            jstor: JstorConfig::default(),
            vitalsource: VitalSourceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_TOML: &str = r#"
[margin]
instance_name = "Example University"
data_dir = "/var/lib/margin"
public_url = "https://lms.example.edu"
master_key_path = "/var/lib/margin/master.key"
signing_key_path = "/var/lib/margin/signing.pem"

[margin.database]
path = "/var/lib/margin/margin.db"

[h]
api_url = "https://h.example.com/api/"
authority = "lms.example.com"
client_id = "h-client"
client_secret = "h-secret"
jwt_client_id = "jwt-client"
jwt_client_secret = "jwt-secret"
via_url = "https://via.example.com/"
via_secret = "via-secret"

[launch]
timestamp_tolerance_secs = 120
nonce_window_secs = 300

[http]
connect_timeout_secs = 5

[blackboard]
client_id = "bb-app"
client_secret = "bb-secret"

[vitalsource]
enabled = true
api_key = "vs-key"
"#;

    fn parse_sample() -> MarginConfig {
        toml::from_str(SAMPLE_TOML).expect("sample TOML should parse")
    }

    #[test]
    fn parse_full_config() {
        let cfg = parse_sample();
        assert_eq!(cfg.margin.instance_name, "Example University");
        assert_eq!(
            cfg.margin.database.path.as_deref(),
            Some("/var/lib/margin/margin.db")
        );
        assert_eq!(cfg.h.authority, "lms.example.com");
        assert_eq!(cfg.h.jwt_client_id, "jwt-client");
        assert_eq!(cfg.launch.timestamp_tolerance_secs, 120);
        assert_eq!(cfg.launch.bearer_lifetime_secs, 86_400);
        assert_eq!(cfg.http.connect_timeout_secs, 5);
        assert_eq!(cfg.http.read_timeout_secs, 10);
        assert_eq!(cfg.http.refresh_timeout_secs, 30);
        assert!(cfg.blackboard.is_configured());
        assert!(!cfg.d2l.is_configured());
        assert!(cfg.vitalsource.enabled);
        cfg.validate().expect("sample config should be valid");
    }

    #[test]
    fn minimal_config_parses() {
        let minimal = r#"
[margin]
instance_name = "Test"
data_dir = "/tmp/margin"
"#;
        let cfg: MarginConfig = toml::from_str(minimal).expect("minimal config should parse");
        assert_eq!(cfg.margin.instance_name, "Test");
        assert_eq!(cfg.launch.timestamp_tolerance_secs, 300);
        assert_eq!(cfg.h.authority, "lms.hypothes.is");
        assert!(!cfg.jstor.enabled);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = parse_sample();
        let serialized = toml::to_string(&cfg).expect("should serialize");
        let deserialized: MarginConfig =
            toml::from_str(&serialized).expect("should deserialize roundtrip");
        assert_eq!(deserialized.h.via_secret, "via-secret");
        assert_eq!(deserialized.launch.nonce_window_secs, 300);
    }

    #[test]
    fn generate_default_is_valid() {
        let cfg = MarginConfig::generate_default();
        cfg.validate().expect("default config should be valid");
    }

    #[test]
    fn validate_requires_instance_name() {
        let mut cfg = MarginConfig::generate_default();
        cfg.margin.instance_name = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("instance_name"));
    }

    #[test]
    fn validate_requires_database_path() {
        let mut cfg = MarginConfig::generate_default();
        cfg.margin.database.path = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("database.path"));
    }

    #[test]
    fn validate_rejects_bad_h_api_url() {
        let mut cfg = MarginConfig::generate_default();
        cfg.h.api_url = "not a url".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("h.api_url"));
    }

    #[test]
    fn validate_nonce_window_covers_tolerance() {
        let mut cfg = MarginConfig::generate_default();
        cfg.launch.timestamp_tolerance_secs = 900;
        cfg.launch.nonce_window_secs = 600;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("nonce_window_secs"));
    }

    #[test]
    fn validate_jstor_requires_credentials() {
        let mut cfg = MarginConfig::generate_default();
        cfg.jstor.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("jstor"));
    }

    #[test]
    fn validate_vendor_oauth_requires_public_url() {
        let mut cfg = MarginConfig::generate_default();
        cfg.d2l.client_id = Some("id".into());
        cfg.d2l.client_secret = Some("secret".into());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("public_url"));

        cfg.margin.public_url = Some("https://margin.example.com".into());
        cfg.validate().expect("public_url set should be valid");
    }

    #[test]
    fn load_from_file() {
        let dir = std::env::temp_dir().join("margin_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("margin.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE_TOML.as_bytes()).unwrap();

        let cfg = MarginConfig::load(&path).expect("should load from file");
        assert_eq!(cfg.margin.instance_name, "Example University");

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }

    #[test]
    fn load_nonexistent_file_returns_io_error() {
        let result = MarginConfig::load(Path::new("/nonexistent/margin.toml"));
        assert!(matches!(result, Err(MarginError::Io(_))));
    }

    #[test]
    fn load_invalid_toml_returns_config_error() {
        let dir = std::env::temp_dir().join("margin_test_bad_toml");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "this is [[[not valid toml").unwrap();

        let result = MarginConfig::load(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("config"));

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }
}
