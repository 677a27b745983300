//! Config loading helpers for CLI surfaces.

use crate::InfraResult;
use pairofcleats_config::{
    SchedulerEnv, ValidatedSchedulerConfig, load_scheduler_config_from_path, to_pretty_json,
};
use pairofcleats_shared::ErrorEnvelope;
use std::collections::BTreeMap;
use std::path::Path;

/// Load and validate the effective config: env > overrides > file > defaults.
pub fn load_effective_config(
    env: &BTreeMap<String, String>,
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
) -> InfraResult<ValidatedSchedulerConfig> {
    let env = SchedulerEnv::from_map(env).map_err(ErrorEnvelope::from)?;
    load_scheduler_config_from_path(config_path, overrides_json, &env)
}

/// Load and validate the effective config, returning deterministic pretty JSON.
pub fn load_effective_config_json(
    env: &BTreeMap<String, String>,
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
) -> InfraResult<String> {
    let config = load_effective_config(env, config_path, overrides_json)?;
    to_pretty_json(&config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn env_wins_over_overrides() -> Result<(), Box<dyn std::error::Error>> {
        let env = BTreeMap::from([("PAIROFCLEATS_CPU_TOKENS".to_owned(), "6".to_owned())]);
        let json = load_effective_config_json(&env, None, Some(r#"{"cpuTokens": 3, "ioTokens": 2}"#))?;
        let value: Value = serde_json::from_str(&json)?;
        assert_eq!(value.get("cpuTokens").and_then(Value::as_f64), Some(6.0));
        assert_eq!(value.get("ioTokens").and_then(Value::as_f64), Some(2.0));
        Ok(())
    }

    #[test]
    fn unknown_override_fields_are_rejected() {
        let result = load_effective_config(&BTreeMap::new(), None, Some(r#"{"cpuTokenz": 3}"#));
        assert!(result.is_err());
    }
}
