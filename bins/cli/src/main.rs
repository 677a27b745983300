//! CLI binary entrypoint.

mod commands;
mod error;
mod format;

use clap::{Parser, Subcommand};
use commands::{IndexCommandInput, run_index, run_info};
use error::{CliError, ExitCode};
use format::{ErrorReport, OutputArgs, OutputMode, ndjson_summary, pretty_json};
use pairofcleats_config::scheduler_config_schema;
use pairofcleats_domain::IndexMode;
use pairofcleats_infra::{InfraError, init_tracing, load_effective_config_json};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "PAIROFCLEATS_";

#[derive(Debug, Parser)]
#[command(
    name = "pairofcleats",
    version,
    about = "Index build scheduler CLI",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    output: OutputArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show build and version details.
    Info,
    /// Config-related commands.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Build an index over a local directory.
    Index {
        /// Directory to index (defaults to current directory).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Optional config file path (JSON/TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Optional JSON overrides (partial config).
        #[arg(long)]
        overrides_json: Option<String>,
        /// Run stages strictly in sequence.
        #[arg(long)]
        no_overlap: bool,
        /// Corpus mode (`code`, `prose`, `extracted-prose`, `records`).
        #[arg(long, value_parser = parse_index_mode)]
        mode: Option<IndexMode>,
        /// Write artifacts under this directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Validate config loading, merging, and normalization.
    Check {
        /// Optional config file path (JSON/TOML).
        #[arg(long)]
        path: Option<PathBuf>,
        /// Optional JSON overrides (partial config).
        #[arg(long)]
        overrides_json: Option<String>,
    },
    /// Show the effective config after applying overrides.
    Show {
        /// Optional config file path (JSON/TOML).
        #[arg(long)]
        path: Option<PathBuf>,
        /// Optional JSON overrides (partial config).
        #[arg(long)]
        overrides_json: Option<String>,
    },
    /// Print the config JSON schema.
    Schema,
}

pub(crate) struct CliOutput {
    stdout: String,
    stderr: String,
    exit_code: ExitCode,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let mode = OutputMode::from_args(&cli.output);
    let env = collect_scoped_env(ENV_PREFIX);
    init_tracing(&env);

    match run(&cli.command, mode, &env) {
        Ok(output) => match write_output(&output) {
            Ok(()) => std::process::ExitCode::from(output.exit_code.as_u8()),
            Err(error) => exit_with_error(&error),
        },
        Err(error) => exit_with_error(&error),
    }
}

fn exit_with_error(error: &CliError) -> std::process::ExitCode {
    drop(writeln!(io::stderr(), "error: {error}"));
    std::process::ExitCode::from(error.exit_code().as_u8())
}

fn run(
    command: &Commands,
    mode: OutputMode,
    env: &BTreeMap<String, String>,
) -> Result<CliOutput, CliError> {
    match command {
        Commands::Info => run_info(mode),
        Commands::Config { command } => match command {
            ConfigCommands::Check {
                path,
                overrides_json,
            } => config_check(mode, env, path.as_deref(), overrides_json.as_deref()),
            ConfigCommands::Show {
                path,
                overrides_json,
            } => config_show(mode, env, path.as_deref(), overrides_json.as_deref()),
            ConfigCommands::Schema => config_schema(mode),
        },
        Commands::Index {
            root,
            config,
            overrides_json,
            no_overlap,
            mode: index_mode,
            out,
        } => {
            let input = IndexCommandInput {
                root: resolve_root(root.as_ref())?,
                config: config.clone(),
                overrides_json: overrides_json.clone(),
                no_overlap: *no_overlap,
                mode: *index_mode,
                out_dir: out.clone(),
            };
            run_index(mode, &input, env)
        },
    }
}

fn parse_index_mode(value: &str) -> Result<IndexMode, String> {
    value.parse::<IndexMode>().map_err(|error| error.to_string())
}

fn config_check(
    mode: OutputMode,
    env: &BTreeMap<String, String>,
    path: Option<&Path>,
    overrides_json: Option<&str>,
) -> Result<CliOutput, CliError> {
    let config_json = match load_effective_config_json(env, path, overrides_json) {
        Ok(config) => config,
        Err(error) => return Ok(format_error_output(mode, &error, ExitCode::InvalidInput)),
    };

    let mut stderr = String::new();
    log_info(&mut stderr, "config check completed", mode.no_progress);

    let stdout = if mode.is_ndjson() {
        ndjson_summary("ok", "config", None)
    } else if mode.is_json() {
        let config_value: serde_json::Value = serde_json::from_str(config_json.trim())?;
        pretty_json(&serde_json::json!({
            "status": "ok",
            "configPath": path.map(|value| value.to_string_lossy().to_string()),
            "effectiveConfig": config_value,
        }))?
    } else {
        path.map_or_else(
            || "status: ok\nconfig: ok\n".to_string(),
            |path| format!("status: ok\nconfig: ok\npath: {}\n", path.to_string_lossy()),
        )
    };

    Ok(CliOutput {
        stdout,
        stderr,
        exit_code: ExitCode::Ok,
    })
}

fn config_show(
    mode: OutputMode,
    env: &BTreeMap<String, String>,
    path: Option<&Path>,
    overrides_json: Option<&str>,
) -> Result<CliOutput, CliError> {
    let config_json = match load_effective_config_json(env, path, overrides_json) {
        Ok(config) => config,
        Err(error) => return Ok(format_error_output(mode, &error, ExitCode::InvalidInput)),
    };

    let stdout = if mode.is_json() || mode.is_ndjson() {
        let config_value: serde_json::Value = serde_json::from_str(config_json.trim())?;
        let payload = serde_json::json!({
            "status": "ok",
            "configPath": path.map(|value| value.to_string_lossy().to_string()),
            "effectiveConfig": config_value,
        });
        if mode.is_ndjson() {
            ndjson_summary("ok", "config", Some(payload))
        } else {
            pretty_json(&payload)?
        }
    } else {
        let mut out = String::from("status: ok\nconfig:\n");
        out.push_str(&config_json);
        out
    };

    Ok(CliOutput {
        stdout,
        stderr: String::new(),
        exit_code: ExitCode::Ok,
    })
}

fn config_schema(mode: OutputMode) -> Result<CliOutput, CliError> {
    let schema = scheduler_config_schema();
    let stdout = if mode.is_ndjson() {
        let mut out = serde_json::to_string(&schema)?;
        out.push('\n');
        out
    } else {
        pretty_json(&schema)?
    };

    Ok(CliOutput {
        stdout,
        stderr: String::new(),
        exit_code: ExitCode::Ok,
    })
}

pub(crate) fn format_error_output(
    mode: OutputMode,
    error: &InfraError,
    exit_code: ExitCode,
) -> CliOutput {
    let report = ErrorReport::from(error);

    let mut stderr = String::new();
    log_info(&mut stderr, "command failed", mode.no_progress);

    let stdout = if mode.is_ndjson() {
        let payload = serde_json::json!({
            "type": "error",
            "status": "error",
            "error": report,
        });
        let mut out = serde_json::to_string(&payload).unwrap_or_else(|_| {
            "{\"type\":\"error\",\"status\":\"error\",\"error\":{\"code\":\"core:internal\",\"message\":\"internal error\",\"kind\":\"INVARIANT\"}}".to_string()
        });
        out.push('\n');
        out
    } else if mode.is_json() {
        // This is a CLI boundary, so JSON serialization errors are internal.
        pretty_json(&serde_json::json!({
            "status": "error",
            "error": report,
        }))
        .unwrap_or_else(|_| {
            "{\"status\":\"error\",\"error\":{\"code\":\"core:internal\",\"message\":\"internal error\",\"kind\":\"INVARIANT\"}}\n".to_string()
        })
    } else {
        let mut out = String::from("status: error\n");
        out.push_str(&report.to_text());
        out
    };

    CliOutput {
        stdout,
        stderr,
        exit_code,
    }
}

pub(crate) fn log_info(stderr: &mut String, message: &str, no_progress: bool) {
    if no_progress {
        return;
    }
    stderr.push_str("info: ");
    stderr.push_str(message);
    stderr.push('\n');
}

fn resolve_root(path: Option<&PathBuf>) -> Result<PathBuf, CliError> {
    match path {
        Some(value) => Ok(value.clone()),
        None => Ok(std::env::current_dir()?),
    }
}

fn write_output(output: &CliOutput) -> Result<(), CliError> {
    let mut stdout = io::stdout();
    stdout.write_all(output.stdout.as_bytes())?;

    if !output.stderr.is_empty() {
        let mut stderr = io::stderr();
        stderr.write_all(output.stderr.as_bytes())?;
        stderr.flush()?;
    }

    Ok(())
}

fn collect_scoped_env(prefix: &str) -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(prefix))
        .collect()
}
