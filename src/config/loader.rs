//! Configuration loader with environment variable expansion

use super::{ConfigError, ExportConfig};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ExportConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let expanded = Self::expand_env_vars(&content);
        let config: ExportConfig = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR_NAME} or
    /// ${VAR_NAME:-default}
    fn expand_env_vars(content: &str) -> String {
        let re =
            regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let mut last_match = 0;
        let mut result = String::with_capacity(content.len());

        for cap in re.captures_iter(content) {
            let full_match = cap.get(0).unwrap();
            let var_name = cap.get(1).unwrap().as_str();

            result.push_str(&content[last_match..full_match.start()]);

            let value = match std::env::var(var_name) {
                Ok(val) => val,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    // No env var and no default: keep the placeholder.
                    None => full_match.as_str().to_string(),
                },
            };
            result.push_str(&value);

            last_match = full_match.end();
        }

        result.push_str(&content[last_match..]);
        result
    }
}
