//! Client configuration.
//!
//! Plain serde value types with built-in defaults. How these are loaded
//! (files, environment, CLI) is the embedding process's concern; the
//! client only ever sees a constructed [`ArenaConfig`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default service origin.
pub const DEFAULT_ORIGIN: &str = "https://lmarena.ai";

/// Path used for the bootstrap navigation.
pub const DEFAULT_BOOT_PATH: &str = "/?mode=direct";

/// Path the upload RPCs are posted to (and used as their referer).
pub const DEFAULT_IMAGE_PATH: &str = "/?chat-modality=image";

/// reCAPTCHA enterprise site key used by the service. Subject to change
/// upstream; overridable via config.
pub const DEFAULT_RECAPTCHA_SITE_KEY: &str = "6Led_uYrAAAAAKjxDIF58fgFtX3t8loNAK85bW9I";

/// Top-level client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Service origin, without a trailing slash.
    pub origin: String,
    /// Path appended to the origin for the bootstrap navigation.
    pub boot_path: String,
    /// Path the upload RPCs are posted to.
    pub image_path: String,
    /// reCAPTCHA enterprise site key passed to the challenge runtime.
    pub recaptcha_site_key: String,
    /// Total timeout for one chat request, in seconds.
    pub timeout_secs: u64,
    /// Total timeout for one upload RPC sequence, in seconds.
    pub upload_timeout_secs: u64,
    /// Whether to cache uploads by content hash for the process lifetime.
    pub upload_cache: bool,
    /// Browser launch settings.
    pub browser: BrowserConfig,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.into(),
            boot_path: DEFAULT_BOOT_PATH.into(),
            image_path: DEFAULT_IMAGE_PATH.into(),
            recaptcha_site_key: DEFAULT_RECAPTCHA_SITE_KEY.into(),
            timeout_secs: 5 * 60,
            upload_timeout_secs: 10 * 60,
            upload_cache: true,
            browser: BrowserConfig::default(),
        }
    }
}

impl ArenaConfig {
    /// Origin with any trailing slash removed.
    #[must_use]
    pub fn origin_trimmed(&self) -> &str {
        self.origin.trim_end_matches('/')
    }

    /// Full URL used for the bootstrap navigation.
    #[must_use]
    pub fn boot_url(&self) -> String {
        format!("{}{}", self.origin_trimmed(), self.boot_path)
    }

    /// Full URL the upload RPCs are posted to.
    #[must_use]
    pub fn image_url(&self) -> String {
        format!("{}{}", self.origin_trimmed(), self.image_path)
    }
}

/// Browser launch settings.
///
/// Headful by default, since the anti-automation challenge widgets are far more
/// reliable outside headless mode.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Explicit browser executable. Falls back to discovery when unset.
    pub executable: Option<PathBuf>,
    /// Persistent profile directory root.
    pub user_data_dir: Option<PathBuf>,
    /// Named profile inside `user_data_dir`.
    pub profile_directory: Option<String>,
    /// Launch in headless mode.
    pub headless: bool,
    /// Launch in incognito mode.
    pub incognito: bool,
    /// Fixed DevTools port. An ephemeral port is picked when unset.
    pub devtools_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_headful() {
        let cfg = ArenaConfig::default();
        assert!(!cfg.browser.headless);
        assert!(cfg.upload_cache);
        assert_eq!(cfg.timeout_secs, 300);
        assert_eq!(cfg.upload_timeout_secs, 600);
    }

    #[test]
    fn boot_url_joins_origin_and_path() {
        let cfg = ArenaConfig {
            origin: "https://example.test/".into(),
            ..ArenaConfig::default()
        };
        assert_eq!(cfg.boot_url(), "https://example.test/?mode=direct");
    }

    #[test]
    fn image_url_uses_image_path() {
        let cfg = ArenaConfig::default();
        assert_eq!(
            cfg.image_url(),
            "https://lmarena.ai/?chat-modality=image"
        );
    }

    #[test]
    fn deserializes_partial_config() {
        let cfg: ArenaConfig =
            serde_json::from_str(r#"{"origin": "https://other.test"}"#).unwrap();
        assert_eq!(cfg.origin, "https://other.test");
        assert_eq!(cfg.boot_path, DEFAULT_BOOT_PATH);
    }
}
