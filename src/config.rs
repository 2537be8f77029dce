use anyhow::{Context, Result};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::claude_tools::DEFAULT_TOOL_PREFIX;
use crate::error::ShimError;

/// Default port for the local proxy
pub const DEFAULT_LISTEN_PORT: u16 = 4000;

pub const DEFAULT_CODEX_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_CODEX_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_CLAUDE_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Codex (responses endpoint) upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodexConfig {
    #[serde(default = "default_codex_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key used when the client sends none
    #[serde(default = "default_codex_api_key_env")]
    pub api_key_env: String,

    /// Instructions file, or a directory with one `<family>.md` per model family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions_file: Option<PathBuf>,
}

/// Claude (messages endpoint) upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_claude_base_url")]
    pub base_url: String,

    #[serde(default = "default_claude_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_tool_prefix")]
    pub tool_prefix: String,

    /// `metadata.user_id` sent when the client omits one; generated on first run
    #[serde(default)]
    pub user_id: String,
}

/// Root configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default)]
    pub codex: CodexConfig,

    #[serde(default)]
    pub claude: ClaudeConfig,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_codex_base_url() -> String {
    DEFAULT_CODEX_BASE_URL.to_string()
}

fn default_claude_base_url() -> String {
    DEFAULT_CLAUDE_BASE_URL.to_string()
}

fn default_codex_api_key_env() -> String {
    DEFAULT_CODEX_API_KEY_ENV.to_string()
}

fn default_claude_api_key_env() -> String {
    DEFAULT_CLAUDE_API_KEY_ENV.to_string()
}

fn default_tool_prefix() -> String {
    DEFAULT_TOOL_PREFIX.to_string()
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            base_url: default_codex_base_url(),
            api_key_env: default_codex_api_key_env(),
            instructions_file: None,
        }
    }
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            base_url: default_claude_base_url(),
            api_key_env: default_claude_api_key_env(),
            tool_prefix: default_tool_prefix(),
            user_id: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            codex: CodexConfig::default(),
            claude: ClaudeConfig::default(),
        }
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

fn random_uuid() -> String {
    let hex = random_hex(16);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Build a user id in the shape Claude clients send:
/// `user_<sha256 hex>_account_<uuid>_session_<uuid>`
pub fn generate_user_id() -> String {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let digest = Sha256::digest(seed);
    let digest_hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "user_{}_account_{}_session_{}",
        digest_hex,
        random_uuid(),
        random_uuid()
    )
}

fn validate_base_url(raw: &str) -> Result<(), ShimError> {
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|source| ShimError::InvalidUpstreamUrl {
            url: raw.to_string(),
            source,
        })
}

impl Config {
    /// ~/.config/aicodewith-shim on Linux, ~/Library/Application Support/aicodewith-shim on macOS
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("aicodewith-shim"))
    }

    pub fn config_file_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from the default location, or from `path` if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_file_path().context("Could not determine config directory")?,
        };
        Self::load_from(&config_path)
    }

    /// Load config from `path`, creating it with defaults if it does not
    /// exist. A missing `user_id` is generated and written back.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let mut config = Self::default();
            config.claude.user_id = generate_user_id();
            config.save_to(path)?;
            tracing::info!(path = %path.display(), "created default config");
            return Ok(config);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(ShimError::from)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        if config.claude.user_id.trim().is_empty() {
            config.claude.user_id = generate_user_id();
            config.save_to(path)?;
            tracing::info!("generated Claude user id");
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_base_url(&self.codex.base_url).context("Invalid [codex] base_url")?;
        validate_base_url(&self.claude.base_url).context("Invalid [claude] base_url")?;
        if self.claude.tool_prefix.is_empty() {
            anyhow::bail!("[claude] tool_prefix must not be empty");
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(ShimError::ConfigDirCreate)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// API key from the environment variable named by `api_key_env`
    pub fn env_api_key(var: &str) -> Option<String> {
        std::env::var(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}
