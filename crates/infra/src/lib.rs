//! # pairofcleats-infra
//!
//! Infrastructure wiring and runtime composition.
//! This crate depends on `app`, `adapters`, `config`, `scheduler`, and `shared`.

/// Config loading helpers used by CLI surfaces.
pub mod config_check;
/// Environment validation helpers used by CLI surfaces.
pub mod env_check;
/// Local index builds over a directory tree.
pub mod index_local;
/// Logger, telemetry, and tracing setup.
pub mod observability;
/// Config to scheduler wiring.
pub mod scheduler_factory;

pub use config_check::{load_effective_config, load_effective_config_json};
pub use env_check::{InfraError, InfraResult, validate_env_parsing};
pub use index_local::{
    DEFAULT_MAX_FILE_BYTES, IndexLocalRequest, collect_source_files, run_index_local,
    run_index_local_with_ctx, write_artifacts_to_dir,
};
pub use observability::{
    Observability, init_tracing, observability_from_env, observability_with_sink, tracing_filter,
};
pub use scheduler_factory::{index_input_from_config, scheduler_options_from_config};

/// Returns the infra crate version.
#[must_use]
pub const fn infra_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairofcleats_adapters::adapters_crate_version;
    use pairofcleats_app::app_crate_version;
    use pairofcleats_config::config_crate_version;
    use pairofcleats_scheduler::scheduler_crate_version;
    use pairofcleats_shared::shared_crate_version;

    fn workspace_deps() -> Vec<String> {
        let cargo_toml = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml"));
        let mut deps = Vec::new();
        let mut in_deps = false;

        for raw_line in cargo_toml.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') {
                in_deps = line == "[dependencies]";
                continue;
            }
            if in_deps && line.starts_with("pairofcleats-") {
                let key = line.split('=').next().unwrap_or("").trim();
                let name = key.split('.').next().unwrap_or("").trim();
                deps.push(name.to_string());
            }
        }

        deps
    }

    #[test]
    fn infra_depends_on_app_adapters_config_scheduler() {
        let deps = workspace_deps();
        let required = [
            "pairofcleats-app",
            "pairofcleats-adapters",
            "pairofcleats-config",
            "pairofcleats-scheduler",
        ];
        for expected in required {
            assert!(
                deps.iter().any(|dep| dep == expected),
                "missing dependency: {expected}"
            );
        }
    }

    #[test]
    fn infra_crate_compiles() {
        assert!(!infra_crate_version().is_empty());
        assert!(!app_crate_version().is_empty());
        assert!(!adapters_crate_version().is_empty());
        assert!(!config_crate_version().is_empty());
        assert!(!scheduler_crate_version().is_empty());
        assert!(!shared_crate_version().is_empty());
    }
}
