pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use parse::{load_config, load_config_str, ConfigError};
pub use types::{
    BackfillConfig, BackoffConfig, BatchConfig, Config, InfluxConfig, KafkaConfig, KandiConfig,
    MetricsConfig, OffsetsInitial,
};

/// Environment variable that may point at the config file
pub const CONFIG_PATH_ENV: &str = "KANDI_CONFIG";

const ENV_VAR_PATTERN: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let re = Regex::new(ENV_VAR_PATTERN).expect("env var pattern is a valid regex");

    re.replace_all(text, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

/// Names of `$env{...}` references still present in `text`, sorted and deduplicated
pub fn unexpanded_env_vars(text: &str) -> Vec<String> {
    let re = Regex::new(ENV_VAR_PATTERN).expect("env var pattern is a valid regex");
    let mut names: Vec<String> = re
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Expands tilde (~) in paths to the user's home directory.
/// Returns the path unchanged if it doesn't start with tilde or home directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path. Returns the first candidate from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. $KANDI_CONFIG
/// 3. ~/.config/kandi/config.yml
/// 4. /etc/kandi/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return Some(expand_tilde(Path::new(&path)));
        }
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/kandi/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/kandi/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
