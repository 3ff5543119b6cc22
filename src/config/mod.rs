//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{BrokerConfig, BrokerType, MessagingConfig, DEFAULT_BROKER_URL};
pub use storage::{StorageConfig, StorageType};

use serde::Deserialize;

use crate::bus::FabricSettings;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PHOTOHUNT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PHOTOHUNT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PHOTOHUNT_LOG";
/// Legacy environment variable naming the broker URL.
pub const BROKER_URL_ENV_VAR: &str = "RABBIT_MQ";

/// A service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Target store, its consumers and the tag linking projection.
    Target,
    /// User store and the owner target-list projection.
    User,
    /// Tag store and the scoring saga.
    Tag,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 3] = [ServiceRole::Target, ServiceRole::User, ServiceRole::Tag];

    /// Name used for per-service queues and logging.
    pub fn name(self) -> &'static str {
        match self {
            ServiceRole::Target => "target-service",
            ServiceRole::User => "auth-service",
            ServiceRole::Tag => "tag-service",
        }
    }
}

/// External image-similarity API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Comparison endpoint.
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            url: "https://api.imagga.com/v2/images-similarity/categories/general_v3".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Target deletion cascade.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    /// Emit the owner-list removal both before and after the tag cascade.
    pub duplicate_owner_removal: bool,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            duplicate_owner_removal: true,
        }
    }
}

fn default_roles() -> Vec<ServiceRole> {
    ServiceRole::ALL.to_vec()
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Delivery semantics.
    pub messaging: MessagingConfig,
    /// Document stores.
    pub storage: StorageConfig,
    /// Similarity API used by the tag saga.
    pub similarity: SimilarityConfig,
    /// Services to run in this process.
    #[serde(default = "default_roles")]
    pub services: Vec<ServiceRole>,
    /// Target deletion cascade.
    pub deletion: DeletionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            messaging: MessagingConfig::default(),
            storage: StorageConfig::default(),
            similarity: SimilarityConfig::default(),
            services: default_roles(),
            deletion: DeletionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `RABBIT_MQ` for the broker URL
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("services")
                    .try_parsing(true),
            )
            .set_override_option("broker.url", std::env::var(BROKER_URL_ENV_VAR).ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Channel settings derived from the messaging section.
    pub fn fabric_settings(&self) -> FabricSettings {
        FabricSettings::from(&self.messaging)
    }

    /// Whether this process runs `role`.
    pub fn runs(&self, role: ServiceRole) -> bool {
        self.services.contains(&role)
    }

    /// Config for tests: in-memory broker and stores, every role.
    pub fn for_test() -> Self {
        Self {
            broker: BrokerConfig {
                broker_type: BrokerType::Memory,
                url: String::new(),
            },
            ..Self::default()
        }
    }
}
