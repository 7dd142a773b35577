//! Configuration validation.
//!
//! Validates the engine, store and paper exchange sections before anything
//! starts, and turns them into typed settings.

use crate::domain::error::EngineError;
use crate::domain::scheduler::SchedulerConfig;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_source_port::HistoryFallback;
use std::time::Duration;

pub fn validate_engine_config(config: &dyn ConfigPort) -> Result<(), EngineError> {
    build_scheduler_config(config)?;
    history_fallback(config)?;
    Ok(())
}

pub fn validate_store_config(config: &dyn ConfigPort) -> Result<(), EngineError> {
    config.require_string("sqlite", "path")?;
    positive_int(config, "sqlite", "pool_size", 4)?;
    Ok(())
}

pub fn validate_paper_config(config: &dyn ConfigPort) -> Result<(), EngineError> {
    let balance = config.get_double("paper", "balance", 10_000.0);
    if balance <= 0.0 {
        return Err(invalid("paper", "balance", "balance must be positive"));
    }
    let fee_rate = config.get_double("paper", "fee_rate", 0.0005);
    if !(0.0..1.0).contains(&fee_rate) {
        return Err(invalid("paper", "fee_rate", "fee_rate must be between 0 and 1"));
    }
    Ok(())
}

pub fn build_scheduler_config(config: &dyn ConfigPort) -> Result<SchedulerConfig, EngineError> {
    let tick = positive_int(config, "engine", "tick_interval_secs", 5)?;
    let timeout = positive_int(config, "engine", "account_timeout_secs", 30)?;
    Ok(SchedulerConfig {
        tick_interval: Duration::from_secs(tick),
        account_timeout: Duration::from_secs(timeout),
    })
}

pub fn history_fallback(config: &dyn ConfigPort) -> Result<HistoryFallback, EngineError> {
    match config.get_string("engine", "history_fallback") {
        Some(value) => value
            .parse()
            .map_err(|reason: String| invalid("engine", "history_fallback", &reason)),
        None => Ok(HistoryFallback::default()),
    }
}

/// Read a positive integer; present but unparsable counts as invalid.
fn positive_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<u64, EngineError> {
    let value = match config.get_string(section, key) {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(section, key, &format!("{key} must be an integer")))?,
        None => default,
    };
    if value <= 0 {
        return Err(invalid(section, key, &format!("{key} must be positive")));
    }
    Ok(value as u64)
}

fn invalid(section: &str, key: &str, reason: &str) -> EngineError {
    EngineError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    fn invalid_key(result: Result<impl std::fmt::Debug, EngineError>) -> String {
        match result {
            Err(EngineError::ConfigInvalid { key, .. }) => key,
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let config = make_config("[engine]\n");
        let scheduler = build_scheduler_config(&config).unwrap();
        assert_eq!(scheduler, SchedulerConfig::default());
        assert_eq!(history_fallback(&config).unwrap(), HistoryFallback::Synthetic);
        assert!(validate_paper_config(&config).is_ok());
    }

    #[test]
    fn explicit_engine_settings() {
        let config = make_config(
            "[engine]\ntick_interval_secs = 2\naccount_timeout_secs = 9\nhistory_fallback = error\n",
        );
        let scheduler = build_scheduler_config(&config).unwrap();
        assert_eq!(scheduler.tick_interval, Duration::from_secs(2));
        assert_eq!(scheduler.account_timeout, Duration::from_secs(9));
        assert_eq!(history_fallback(&config).unwrap(), HistoryFallback::Error);
    }

    #[test]
    fn zero_tick_interval_fails() {
        let config = make_config("[engine]\ntick_interval_secs = 0\n");
        assert_eq!(invalid_key(validate_engine_config(&config)), "tick_interval_secs");
    }

    #[test]
    fn non_numeric_timeout_fails() {
        let config = make_config("[engine]\naccount_timeout_secs = soon\n");
        assert_eq!(invalid_key(build_scheduler_config(&config)), "account_timeout_secs");
    }

    #[test]
    fn unknown_fallback_fails() {
        let config = make_config("[engine]\nhistory_fallback = zeros\n");
        assert_eq!(invalid_key(validate_engine_config(&config)), "history_fallback");
    }

    #[test]
    fn missing_sqlite_path_fails() {
        let config = make_config("[sqlite]\npool_size = 2\n");
        assert!(matches!(
            validate_store_config(&config),
            Err(EngineError::ConfigMissing { ref section, ref key }) if section == "sqlite" && key == "path"
        ));
        let config = make_config("[sqlite]\npath = orders.db\n");
        assert!(validate_store_config(&config).is_ok());
    }

    #[test]
    fn paper_balance_and_fee_bounds() {
        let config = make_config("[paper]\nbalance = 0\n");
        assert_eq!(invalid_key(validate_paper_config(&config)), "balance");
        let config = make_config("[paper]\nfee_rate = 1.5\n");
        assert_eq!(invalid_key(validate_paper_config(&config)), "fee_rate");
    }
}
