use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use ttls_proto::framing::{DEFAULT_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE};
use ttls_proto::{EAP_TTLS_MAX_VERSION, EapType, EapUser, TtlsAuth, TtlsConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// EAP-TTLS session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlsSettings {
    /// Highest version offered in the Start frame (0 or 1)
    #[serde(default)]
    pub max_version: u8,

    /// Largest outbound fragment, in bytes
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    /// Run a TNC inner method after successful authentication
    #[serde(default)]
    pub tnc: bool,

    /// Seconds a session may sit idle before it is dropped
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

fn default_fragment_size() -> usize {
    DEFAULT_FRAGMENT_SIZE
}

fn default_session_timeout() -> u64 {
    crate::DEFAULT_SESSION_TIMEOUT.as_secs()
}

impl Default for TtlsSettings {
    fn default() -> Self {
        TtlsSettings {
            max_version: 0,
            fragment_size: default_fragment_size(),
            tnc: false,
            session_timeout: default_session_timeout(),
        }
    }
}

impl TtlsSettings {
    pub fn session_config(&self) -> TtlsConfig {
        TtlsConfig {
            max_version: self.max_version,
            fragment_size: self.fragment_size,
            tnc: self.tnc,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }
}

/// Server certificate for the Phase 1 handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM certificate chain
    pub cert_path: String,
    /// PEM private key
    pub key_path: String,
}

/// User configuration
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity, or "*" to match any outer identity
    pub username: String,

    /// Phase 1 (outer) entry instead of a tunneled one
    #[serde(default)]
    pub outer: bool,

    /// Plaintext password
    #[serde(default)]
    pub password: Option<String>,

    /// NT password hash as 32 hex characters
    #[serde(default)]
    pub password_hash: Option<String>,

    /// Nested EAP methods, in the order they are proposed
    #[serde(default)]
    pub methods: Vec<String>,

    /// Allowed non-EAP Phase 2 protocols ("PAP", "CHAP", "MSCHAP", "MSCHAPV2")
    #[serde(default)]
    pub ttls_auth: Vec<String>,

    /// Pin the EAP-TTLS version for this user
    #[serde(default)]
    pub force_version: Option<u8>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .field("outer", &self.outer)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_hash", &self.password_hash.as_ref().map(|_| "<redacted>"))
            .field("methods", &self.methods)
            .field("ttls_auth", &self.ttls_auth)
            .field("force_version", &self.force_version)
            .finish()
    }
}

impl User {
    /// Convert to a credential store entry
    pub fn to_eap_user(&self) -> Result<EapUser, ConfigError> {
        let methods = self
            .methods
            .iter()
            .map(|name| {
                EapType::from_name(name).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "User {} has unknown EAP method '{}'",
                        self.username, name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut ttls_auth = TtlsAuth::empty();
        for name in &self.ttls_auth {
            let auth = TtlsAuth::from_name(name).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "User {} has unknown Phase 2 protocol '{}'",
                    self.username, name
                ))
            })?;
            ttls_auth.insert(auth);
        }

        let (password, password_hash) = match (&self.password, &self.password_hash) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "User {} has both password and password_hash",
                    self.username
                )));
            }
            (Some(password), None) => (Some(password.as_bytes().to_vec()), false),
            (None, Some(hash)) => {
                let hash = hex::decode(hash).ok().filter(|h| h.len() == 16).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "User {} has a malformed password_hash (expected 32 hex characters)",
                        self.username
                    ))
                })?;
                (Some(hash), true)
            }
            (None, None) => (None, false),
        };

        if password.is_none() && !self.outer && (!methods.is_empty() || ttls_auth != TtlsAuth::empty()) {
            return Err(ConfigError::Invalid(format!(
                "User {} grants Phase 2 methods but has no password",
                self.username
            )));
        }

        if let Some(version) = self.force_version
            && version > EAP_TTLS_MAX_VERSION
        {
            return Err(ConfigError::Invalid(format!(
                "User {} forces unsupported version {}",
                self.username, version
            )));
        }

        Ok(EapUser {
            methods,
            password,
            password_hash,
            ttls_auth,
            force_version: self.force_version,
        })
    }
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub ttls: TtlsSettings,

    /// Server certificate; required to run the rustls tunnel
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Users for outer and tunneled authentication
    #[serde(default)]
    pub users: Vec<User>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttls.max_version > EAP_TTLS_MAX_VERSION {
            return Err(ConfigError::Invalid(format!(
                "max_version {} is not supported (highest is {})",
                self.ttls.max_version, EAP_TTLS_MAX_VERSION
            )));
        }

        if self.ttls.fragment_size == 0 {
            return Err(ConfigError::Invalid("fragment_size cannot be 0".to_string()));
        }
        if self.ttls.fragment_size > MAX_FRAGMENT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "fragment_size {} exceeds {}",
                self.ttls.fragment_size, MAX_FRAGMENT_SIZE
            )));
        }

        if self.ttls.session_timeout == 0 {
            return Err(ConfigError::Invalid("session_timeout cannot be 0".to_string()));
        }

        if let Some(tls) = &self.tls
            && (tls.cert_path.is_empty() || tls.key_path.is_empty())
        {
            return Err(ConfigError::Invalid(
                "TLS certificate and key paths cannot be empty".to_string(),
            ));
        }

        for user in &self.users {
            if user.username.is_empty() {
                return Err(ConfigError::Invalid("User has empty username".to_string()));
            }
            if user.username == "*" && !user.outer {
                return Err(ConfigError::Invalid(
                    "Wildcard user is only allowed for outer identities".to_string(),
                ));
            }
            user.to_eap_user()?;
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn example() -> Self {
        Config {
            log_level: Some("info".to_string()),
            ttls: TtlsSettings::default(),
            tls: Some(TlsSettings {
                cert_path: "/etc/usg-ttls/server.pem".to_string(),
                key_path: "/etc/usg-ttls/server-key.pem".to_string(),
            }),
            users: vec![
                User {
                    username: "*".to_string(),
                    outer: true,
                    methods: vec!["TTLS".to_string()],
                    ..Default::default()
                },
                User {
                    username: "alice".to_string(),
                    password: Some("password1".to_string()),
                    methods: vec!["MD5".to_string()],
                    ttls_auth: vec!["PAP".to_string(), "MSCHAPV2".to_string()],
                    ..Default::default()
                },
                User {
                    username: "bob".to_string(),
                    password_hash: Some("8846f7eaee8fb117ad06bdd830b7586c".to_string()),
                    ttls_auth: vec!["MSCHAP".to_string(), "MSCHAPV2".to_string()],
                    ..Default::default()
                },
            ],
        }
    }
}
