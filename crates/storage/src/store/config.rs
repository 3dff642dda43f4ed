#![forbid(unsafe_code)]

use super::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub app_name: String,
    pub db_file_name: String,
    pub busy_timeout_ms: u64,
    /// Locale stamped on rows inserted without one.
    pub default_locale: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            app_name: "default".to_string(),
            db_file_name: "odt_rows.db".to_string(),
            busy_timeout_ms: 5_000,
            default_locale: "en".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(LifecycleError::Config("app_name must not be empty".to_string()));
        }
        if self.app_name.contains(['/', '\\']) || self.app_name.starts_with('.') {
            return Err(LifecycleError::Config(format!(
                "app_name `{}` must be a plain directory name",
                self.app_name
            )));
        }
        if self.db_file_name.trim().is_empty() {
            return Err(LifecycleError::Config(
                "db_file_name must not be empty".to_string(),
            ));
        }
        if self.db_file_name.contains(['/', '\\']) {
            return Err(LifecycleError::Config(format!(
                "db_file_name `{}` must be a bare file name",
                self.db_file_name
            )));
        }
        if self.busy_timeout_ms == 0 {
            return Err(LifecycleError::Config(
                "busy_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
