use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub default_base_url: String,
}

/// OpenAI-compatible chat completion providers.
pub fn provider_configs() -> Vec<ProviderConfig> {
    let base_configs = vec![
        ("openai", "OpenAI", "https://api.openai.com"),
        ("openrouter", "OpenRouter", "https://openrouter.ai/api"),
        ("groq", "Groq", "https://api.groq.com/openai"),
        ("mistral", "Mistral AI", "https://api.mistral.ai"),
        ("deepseek", "DeepSeek", "https://api.deepseek.com"),
        ("together", "Together AI", "https://api.together.xyz"),
        ("custom", "Custom (OpenAI compatible)", "http://127.0.0.1:5000"),
    ];

    base_configs
        .into_iter()
        .map(|(id, name, base)| ProviderConfig {
            id: id.to_string(),
            name: name.to_string(),
            default_base_url: base.to_string(),
        })
        .collect()
}

pub fn get_provider_config(provider_id: &str) -> Option<ProviderConfig> {
    provider_configs()
        .into_iter()
        .find(|p| p.id.eq_ignore_ascii_case(provider_id))
}

pub fn resolve_base_url(provider_id: &str, custom_base_url: Option<&str>) -> String {
    if let Some(custom) = custom_base_url {
        let custom = custom.trim();
        if !custom.is_empty() {
            return custom.trim_end_matches('/').to_string();
        }
    }

    get_provider_config(provider_id)
        .map(|cfg| cfg.default_base_url)
        .unwrap_or_else(|| "https://api.openai.com".to_string())
}

pub fn build_endpoint_url(provider_id: &str, custom_base_url: Option<&str>) -> String {
    let base_url = resolve_base_url(provider_id, custom_base_url);
    let trimmed = base_url.trim_end_matches('/');

    // If base_url already contains /v1, don't add it again
    if trimmed.ends_with("/v1") {
        format!("{}/chat/completions", trimmed)
    } else {
        format!("{}/v1/chat/completions", trimmed)
    }
}

/// `<data dir>/loomchat`, e.g. `~/.local/share/loomchat` on Linux.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("loomchat"))
}

pub fn default_lorebook_dir() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join("lorebooks"))
}

pub fn default_log_dir() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join("logs"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// `RUST_LOG`-style directive. `None` means `info`.
    pub filter: Option<String>,
    /// Directory for daily log files. `None` logs to stderr.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub provider_id: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Connect deadline for every call; also the whole-request deadline for non-stream calls.
    pub timeout_ms: Option<u64>,
    pub headers: HashMap<String, String>,
    pub lorebook_dir: Option<PathBuf>,
    /// Messages scanned for lorebook keys when neither request nor lorebook says; 0 = all.
    pub default_scan_depth: usize,
    pub channel_capacity: usize,
    pub log: LogSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER.to_string(),
            base_url: None,
            api_key: None,
            timeout_ms: None,
            headers: HashMap::new(),
            lorebook_dir: None,
            default_scan_depth: 0,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            log: LogSettings::default(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: Option<String>, fallback: T) -> T {
    match raw {
        None => fallback,
        Some(value) => match value.trim().parse::<T>() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(key, value = value.as_str(), "ignoring unparseable number");
                fallback
            }
        },
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl EngineConfig {
    /// Reads `LOOMCHAT_*` variables, loading a `.env` file first when one exists. Without
    /// `LOOMCHAT_LOREBOOK_DIR`, the per-user lorebook directory is used if it exists.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        if config.lorebook_dir.is_none() {
            config.lorebook_dir = default_lorebook_dir().filter(|dir| dir.is_dir());
        }
        config
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let timeout_ms = Some(parse_number(
            "LOOMCHAT_TIMEOUT_MS",
            non_empty(lookup("LOOMCHAT_TIMEOUT_MS")),
            0u64,
        ))
        .filter(|ms| *ms > 0);

        Self {
            provider_id: non_empty(lookup("LOOMCHAT_PROVIDER")).unwrap_or(defaults.provider_id),
            base_url: non_empty(lookup("LOOMCHAT_BASE_URL")),
            api_key: non_empty(lookup("LOOMCHAT_API_KEY")),
            timeout_ms,
            headers: defaults.headers,
            lorebook_dir: non_empty(lookup("LOOMCHAT_LOREBOOK_DIR")).map(PathBuf::from),
            default_scan_depth: parse_number(
                "LOOMCHAT_SCAN_DEPTH",
                non_empty(lookup("LOOMCHAT_SCAN_DEPTH")),
                defaults.default_scan_depth,
            ),
            channel_capacity: defaults.channel_capacity,
            log: LogSettings {
                filter: non_empty(lookup("LOOMCHAT_LOG")),
                dir: non_empty(lookup("LOOMCHAT_LOG_DIR")).map(PathBuf::from),
            },
        }
    }

    pub fn endpoint_url(&self) -> String {
        build_endpoint_url(&self.provider_id, self.base_url.as_deref())
    }
}
