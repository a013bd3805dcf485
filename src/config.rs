// Gateway Configuration and Constants

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8008;
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// Environment variables
pub const SESSION_DIR_ENV: &str = "TOOLGATE_SESSION_DIR";
pub const DEBUG_ENV: &str = "TOOLGATE_DEBUG";
pub const BASE_URL_ENV: &str = "TOOLGATE_BASE_URL";
pub const PORT_ENV: &str = "TOOLGATE_PORT";

// Persisted file names
pub const METADATA_FILE_NAME: &str = "tool-metadata.json";
pub const API_ERROR_FILE_NAME: &str = "api-error.json";
pub const LOG_FILE_NAME: &str = "interceptor.log";

/// When set, only tools whose name carries `NAMESPACED_TOOL_PREFIX` get the
/// metadata fields injected into their schema.
pub const NAMESPACED_TOOLS_ONLY: bool = false;
pub const NAMESPACED_TOOL_PREFIX: &str = "mcp__";

const GLOBAL_DIR_NAME: &str = ".toolgate";

/// Where the provider's origin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseUrl {
    /// Read from the environment on every call so the provider can be switched at runtime.
    Env {
        var: &'static str,
        default: &'static str,
    },
    Fixed(String),
}

impl BaseUrl {
    pub fn from_env() -> Self {
        BaseUrl::Env {
            var: BASE_URL_ENV,
            default: DEFAULT_BASE_URL,
        }
    }

    /// Current origin, without a trailing slash.
    pub fn resolve(&self) -> String {
        let raw = match self {
            BaseUrl::Env { var, default } => std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string()),
            BaseUrl::Fixed(url) => url.clone(),
        };
        raw.trim().trim_end_matches('/').to_string()
    }
}

impl Default for BaseUrl {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub base_url: BaseUrl,
    pub session_dir: Option<PathBuf>,
    pub global_dir: PathBuf,
    pub debug: bool,
    pub namespaced_tools_only: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let session_dir = std::env::var(SESSION_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let debug = std::env::var(DEBUG_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        Self {
            port,
            base_url: BaseUrl::from_env(),
            session_dir,
            global_dir: global_directory(),
            debug,
            namespaced_tools_only: NAMESPACED_TOOLS_ONLY,
        }
    }

    pub fn api_error_path(&self) -> PathBuf {
        self.global_dir.join(API_ERROR_FILE_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.global_dir.join(LOG_FILE_NAME)
    }
}

/// Directory shared by every session: holds the last API error and the debug log.
pub fn global_directory() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(GLOBAL_DIR_NAME),
        None => std::env::temp_dir().join(GLOBAL_DIR_NAME),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_base_url_drops_trailing_slash() {
        let base = BaseUrl::Fixed("https://api.example.com/".to_string());
        assert_eq!(base.resolve(), "https://api.example.com");
    }

    #[test]
    fn env_base_url_falls_back_to_default_when_unset() {
        let base = BaseUrl::Env {
            var: "TOOLGATE_TEST_UNSET_BASE_URL",
            default: DEFAULT_BASE_URL,
        };
        assert_eq!(base.resolve(), DEFAULT_BASE_URL);
    }

    #[test]
    fn debug_flag_accepts_common_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" TRUE "));
        assert!(is_truthy("on"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
