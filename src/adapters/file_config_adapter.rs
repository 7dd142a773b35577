//! INI file configuration adapter.
//!
//! Environment variables named `RULETRADER_<SECTION>_<KEY>` override values
//! from the file, so deployments can inject secrets and paths.

use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::collections::HashMap;
use std::path::Path;

pub const ENV_PREFIX: &str = "RULETRADER";

pub struct FileConfigAdapter {
    config: Ini,
    overrides: HashMap<String, String>,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let mut config = Ini::new();
        config.load(path).map_err(std::io::Error::other)?;
        Ok(Self {
            config,
            overrides: env_overrides(std::env::vars()),
        })
    }

    /// Parse INI text. Environment overrides are not applied.
    pub fn from_string(content: &str) -> Result<Self, String> {
        let mut config = Ini::new();
        config.read(content.to_string())?;
        Ok(Self {
            config,
            overrides: HashMap::new(),
        })
    }

    pub fn with_overrides<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.overrides.extend(env_overrides(vars));
        self
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value.to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }

    fn override_key(section: &str, key: &str) -> String {
        format!("{}_{}", section, key).to_ascii_uppercase()
    }
}

/// Keep the prefixed variables, keyed as `SECTION_KEY`.
fn env_overrides<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{ENV_PREFIX}_");
    vars.into_iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(&prefix)
                .map(|rest| (rest.to_ascii_uppercase(), value))
        })
        .collect()
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.overrides
            .get(&Self::override_key(section, key))
            .cloned()
            .or_else(|| self.config.get(section, key))
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.get_string(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.get_string(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.get_string(section, key)
            .as_deref()
            .and_then(Self::parse_bool)
            .unwrap_or(default)
    }
}
