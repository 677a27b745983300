//! Info command handler.

use crate::CliOutput;
use crate::error::{CliError, ExitCode};
use crate::format::{OutputMode, ndjson_summary, pretty_json};
use pairofcleats_config::{CURRENT_CONFIG_VERSION, config_crate_version};
use pairofcleats_infra::infra_crate_version;
use pairofcleats_scheduler::scheduler_crate_version;

/// Run the info command.
pub fn run_info(mode: OutputMode) -> Result<CliOutput, CliError> {
    let build = serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "schedulerVersion": scheduler_crate_version(),
        "configVersion": config_crate_version(),
        "infraVersion": infra_crate_version(),
        "configSchemaVersion": CURRENT_CONFIG_VERSION,
    });

    let stdout = if mode.is_ndjson() {
        ndjson_summary("ok", "info", Some(serde_json::json!({ "build": build })))
    } else if mode.is_json() {
        pretty_json(&serde_json::json!({ "status": "ok", "build": build }))?
    } else {
        format!(
            "status: ok\nname: {}\nversion: {}\nscheduler: {}\nconfig: {}\ninfra: {}\nconfigSchemaVersion: {}\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            scheduler_crate_version(),
            config_crate_version(),
            infra_crate_version(),
            CURRENT_CONFIG_VERSION,
        )
    };

    Ok(CliOutput {
        stdout,
        stderr: String::new(),
        exit_code: ExitCode::Ok,
    })
}
