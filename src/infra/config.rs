use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, InitArgs};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ignore patterns applied on top of .gitignore when gathering context
    pub ignore_patterns: Vec<String>,

    /// Context snapshot settings
    pub context: ContextConfig,

    /// Model endpoint settings
    pub model: ModelConfig,

    /// Edit session settings
    pub session: SessionConfig,

    /// Apply-time settings
    pub apply: ApplyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Total snapshot ceiling in bytes; above this, the largest files are
    /// demoted to tree-only entries (no content) until under the ceiling.
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// OpenAI-compatible chat completions endpoint
    pub api_url: String,
    /// Model identifier sent in the request body
    pub model: String,
    /// Environment variable holding the API key (never stored in config)
    pub api_key_env: String,
    /// Request timeout; expiry surfaces as a model-unavailable abort
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How many times a malformed model response is retried with corrective
    /// feedback before the session aborts.
    pub parse_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Replace the first occurrence when a region match is ambiguous instead
    /// of failing the operation.
    pub allow_first_match: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_patterns: default_ignore_patterns(),
            context: ContextConfig::default(),
            model: ModelConfig::default(),
            session: SessionConfig::default(),
            apply: ApplyConfig::default(),
        }
    }
}

fn default_ignore_patterns() -> Vec<String> {
    [
        "target/",
        "node_modules/",
        "dist/",
        "build/",
        ".git/",
        "*.pyc",
        "__pycache__/",
        ".DS_Store",
        "Thumbs.db",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 90,
            temperature: 0.0,
            max_tokens: 8192,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { parse_retries: 2 }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            allow_first_match: false,
        }
    }
}

pub fn load_config() -> Result<Config> {
    load_config_from(Path::new("."))
}

/// Layer `aitk.toml`/`.aitk.toml` from `dir` under `AITK_`-prefixed
/// environment overrides. A malformed file is an error; every field has a
/// serde default, so a missing file just yields `Config::default()`.
pub fn load_config_from(dir: &Path) -> Result<Config> {
    let mut builder = config::Config::builder();

    // Load from config files in priority order
    for name in ["aitk.toml", ".aitk.toml"] {
        let candidate = dir.join(name);
        if candidate.exists() {
            builder = builder.add_source(config::File::from(candidate));
            break;
        }
    }

    // Add environment variables with AITK_ prefix (AITK_MODEL__API_URL etc.)
    builder = builder.add_source(
        config::Environment::with_prefix("AITK")
            .separator("__")
            .try_parsing(true),
    );

    let cfg = builder.build().context("Failed to load configuration")?;
    cfg.try_deserialize::<Config>()
        .context("Failed to parse configuration")
}

pub fn init(args: InitArgs, ctx: &AppContext) -> Result<()> {
    let config_path = args.path.join("aitk.toml");

    if config_path.exists() && !args.force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}
