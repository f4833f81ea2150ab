use crate::error::{ExchangeError, Result};
use crate::matcher::MatcherSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub authority: AuthorityConfig,
    pub registry: RegistryConfig,
    pub matcher: MatcherConfig,
    pub exchange: ExchangeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// DID of the party operating this client.
    pub did: Option<String>,
    /// Endpoint of the party's own repository host.
    pub service: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub plc_directory: String,
    pub appview: String,
    pub backlinks: String,
    pub cdn_base: String,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub endpoint: String,
    pub trusted_issuers: Vec<String>,
    pub private_key_hex: Option<String>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub hub_handle: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub search_limit: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub page_size: Option<u32>,
    /// Web origin linked from offer announcements.
    pub app_origin: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            did: None,
            service: "https://bsky.social".to_string(),
            access_token: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            plc_directory: "https://plc.directory".to_string(),
            appview: "https://public.api.bsky.app".to_string(),
            backlinks: "https://constellation.microcosm.blue".to_string(),
            cdn_base: "https://cdn.bsky.app/img/feed_fullsize/plain".to_string(),
            request_timeout_seconds: Some(30),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787/sign-seal".to_string(),
            trusted_issuers: vec![],
            private_key_hex: None,
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hub_handle: "suibari.com".to_string(),
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            search_limit: Some(200),
            max_in_flight: Some(10),
            probe_timeout_ms: Some(5000),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            page_size: Some(50),
            app_origin: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
    pub fn install(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));
        let registry = tracing_subscriber::registry().with(filter);

        match self.format.as_deref() {
            Some("json") => {
                let _ = registry.with(tracing_subscriber::fmt::layer().json()).try_init();
            }
            _ => {
                let _ = registry.with(tracing_subscriber::fmt::layer()).try_init();
            }
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| ExchangeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| ExchangeError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("STICKER_ACCESS_TOKEN") {
            self.session.access_token = Some(token);
        }

        if let Ok(key) = std::env::var("ISSUER_PRIVATE_KEY_HEX") {
            self.authority.private_key_hex = Some(key);
        }

        if let Ok(endpoint) = std::env::var("SEAL_AUTHORITY_URL") {
            self.authority.endpoint = endpoint;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("session.service", &self.session.service),
            ("network.plc_directory", &self.network.plc_directory),
            ("network.appview", &self.network.appview),
            ("network.backlinks", &self.network.backlinks),
            ("network.cdn_base", &self.network.cdn_base),
            ("authority.endpoint", &self.authority.endpoint),
            ("registry.hub_handle", &self.registry.hub_handle),
        ] {
            if value.is_empty() {
                return Err(ExchangeError::Config(format!("{} cannot be empty", name)));
            }
        }

        if let Some(did) = &self.session.did {
            if !did.starts_with("did:") {
                return Err(ExchangeError::Config(format!("session.did is not a DID: {}", did)));
            }
        }

        if let Some(issuer) = self.authority.trusted_issuers.iter().find(|i| !i.starts_with("did:")) {
            return Err(ExchangeError::Config(format!("Trusted issuer is not a DID: {}", issuer)));
        }

        if self.authority.port == 0 {
            return Err(ExchangeError::Config("Authority port cannot be 0".to_string()));
        }

        if self.matcher.max_in_flight == Some(0) {
            return Err(ExchangeError::Config("matcher.max_in_flight must be at least 1".to_string()));
        }

        if let Some(page_size) = self.exchange.page_size {
            if page_size == 0 || page_size > 100 {
                return Err(ExchangeError::Config(
                    "exchange.page_size must be between 1 and 100".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.exchange.page_size.unwrap_or(50)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_seconds.unwrap_or(30))
    }

    pub fn matcher_settings(&self) -> MatcherSettings {
        let defaults = MatcherSettings::default();
        MatcherSettings {
            search_limit: self.matcher.search_limit.unwrap_or(defaults.search_limit),
            max_in_flight: self.matcher.max_in_flight.unwrap_or(defaults.max_in_flight),
            probe_timeout: self
                .matcher
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
        }
    }

    pub fn get_authority_address(&self) -> String {
        format!("{}:{}", self.authority.host, self.authority.port)
    }

    pub fn session_did(&self) -> Result<&str> {
        self.session
            .did
            .as_deref()
            .ok_or_else(|| ExchangeError::Config("session.did is not configured".to_string()))
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| ExchangeError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| ExchangeError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.registry.hub_handle, "suibari.com");
        assert_eq!(config.page_size(), 50);
        assert_eq!(config.matcher_settings().search_limit, 200);
        assert_eq!(config.matcher_settings().probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.exchange.page_size = Some(0);
        assert!(config.validate().is_err());

        config.exchange.page_size = Some(25);
        config.authority.trusted_issuers = vec!["not-a-did".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(path).unwrap();
        assert_eq!(loaded_config.authority.port, 8787);
        assert_eq!(loaded_config.network.cdn_base, AppConfig::default().network.cdn_base);
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            "[session]\ndid = \"did:plc:alice\"\n\n[matcher]\nmax_in_flight = 3\n"
        )
        .unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.session_did().unwrap(), "did:plc:alice");
        assert_eq!(config.matcher_settings().max_in_flight, 3);
        assert_eq!(config.matcher_settings().search_limit, 200);
        assert_eq!(config.registry.hub_handle, "suibari.com");
    }
}
