//! Startup configuration from the environment

use std::path::PathBuf;

const DEFAULT_PORT: u16 = 7431;
const DEFAULT_CATALOG_URL: &str = "https://vicr123.github.io/theshell/backgrounds/";
const APP_DIR: &str = "desktop-background";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub catalog_url: String,
    pub cache_dir: PathBuf,
    pub settings_path: PathBuf,
    /// Number of screens; screen 0 belongs to the engine
    pub screens: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let catalog_url =
            lookup("BACKGROUND_CATALOG_URL").unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string());

        let cache_dir = lookup("BACKGROUND_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir(dirs::cache_dir()));

        let settings_path = lookup("BACKGROUND_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir(dirs::config_dir()).join("settings.json"));

        let screens = lookup("BACKGROUND_SCREENS")
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(1);

        Self {
            port,
            catalog_url,
            cache_dir,
            settings_path,
            screens,
        }
    }
}

fn base_dir(platform_dir: Option<PathBuf>) -> PathBuf {
    platform_dir
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
        assert_eq!(config.screens, 1);
        assert!(config.cache_dir.ends_with(APP_DIR));
        assert!(config.settings_path.ends_with("desktop-background/settings.json"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("BACKGROUND_CATALOG_URL", "http://localhost:8080/bg"),
            ("BACKGROUND_CACHE_DIR", "/tmp/bg-cache"),
            ("BACKGROUND_SCREENS", "3"),
        ]
        .into_iter()
        .collect();

        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 9000);
        assert_eq!(config.catalog_url, "http://localhost:8080/bg");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/bg-cache"));
        assert_eq!(config.screens, 3);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = AppConfig::from_lookup(|k| match k {
            "PORT" => Some("not-a-port".to_string()),
            "BACKGROUND_SCREENS" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.screens, 1);
    }
}
