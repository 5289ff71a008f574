use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
const MIN_CHECK_INTERVAL_SECS: u64 = 1;

/// Process-wide engine configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Public base URL for deep links, normalized without a trailing slash.
    /// `None` means deep links are omitted from notifications.
    pub webui_url: Option<String>,
    /// Local port the chat backend listens on; used for the in-process
    /// fallback base URL when `webui_url` is unset.
    pub port: u16,
    /// Poll period of the scheduler loop.
    pub check_interval: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Lets tests inject values without
    /// mutating process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let webui_url = lookup("WEBUI_URL").and_then(|raw| normalize_base_url(&raw));

        let port = lookup("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let interval_secs = lookup("SCHEDULER_CHECK_INTERVAL")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
            .max(MIN_CHECK_INTERVAL_SECS);

        Self {
            webui_url,
            port,
            check_interval: Duration::from_secs(interval_secs),
        }
    }

    /// In-process base URL of the chat backend, always local.
    pub fn local_api_base(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            webui_url: None,
            port: DEFAULT_PORT,
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
        }
    }
}

/// Strip trailing slashes; empty input means "no deep links".
fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let cfg = EngineConfig::from_lookup(|_| None);
        assert_eq!(cfg.webui_url, None);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_webui_url_trailing_slash_stripped() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[(
            "WEBUI_URL",
            "https://owui.example.com/",
        )]));
        assert_eq!(cfg.webui_url.as_deref(), Some("https://owui.example.com"));
    }

    #[test]
    fn test_empty_webui_url_means_no_deep_links() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[("WEBUI_URL", "")]));
        assert_eq!(cfg.webui_url, None);
    }

    #[test]
    fn test_check_interval_floor() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[("SCHEDULER_CHECK_INTERVAL", "0")]));
        assert_eq!(cfg.check_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_custom_port_feeds_local_base() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[("PORT", "3000")]));
        assert_eq!(cfg.local_api_base(), "http://127.0.0.1:3000");
    }

    #[test]
    fn test_invalid_port_falls_back() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[("PORT", "not-a-port")]));
        assert_eq!(cfg.port, 8080);
    }
}
