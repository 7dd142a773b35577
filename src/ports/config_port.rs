//! Configuration access port trait.
//!
//! Sections used by the engine: `[engine]`, `[sqlite]`, `[data]`, `[paper]`
//! and `[log]`.

use crate::domain::error::EngineError;

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;
    fn get_double(&self, section: &str, key: &str, default: f64) -> f64;
    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool;

    /// True when the key is present, whether or not it parses.
    fn has_key(&self, section: &str, key: &str) -> bool {
        self.get_string(section, key).is_some()
    }

    /// A non-blank value, or `ConfigMissing`.
    fn require_string(&self, section: &str, key: &str) -> Result<String, EngineError> {
        self.get_string(section, key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::ConfigMissing {
                section: section.to_string(),
                key: key.to_string(),
            })
    }
}
