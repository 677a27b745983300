//! CLI E2E smoke tests.

use pairofcleats_domain::sha256_hex;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_pairofcleats"));
    for (key, _) in std::env::vars() {
        if key.starts_with("PAIROFCLEATS_") {
            command.env_remove(key);
        }
    }
    command
}

fn run_json(args: &[&str]) -> io::Result<serde_json::Value> {
    let output = cli().args(["--output", "json"]).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::other(format!("{args:?} failed: {stderr}")));
    }
    serde_json::from_slice(&output.stdout).map_err(io::Error::other)
}

fn seed_repo(label: &str) -> io::Result<PathBuf> {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let root = std::env::temp_dir().join(format!("pairofcleats-e2e-{label}-{unique}"));
    let files = [
        ("src/lib.rs", "use crate::store;\nuse crate::wire;\n\npub fn open() {\n    store::load();\n}\n"),
        ("src/store.rs", "use crate::wire;\n\npub fn load() -> usize {\n    wire::decode(b\"x\")\n}\n"),
        ("src/wire.rs", "pub fn decode(bytes: &[u8]) -> usize {\n    bytes.len()\n}\n"),
        ("docs/usage.md", "Open the store, then load records.\n"),
    ];
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
    }
    Ok(root)
}

#[test]
fn info_output_is_deterministic() -> io::Result<()> {
    let first = run_json(&["info"])?;
    let second = run_json(&["info"])?;

    assert_eq!(first, second, "info output should be deterministic");
    Ok(())
}

#[test]
fn config_schema_lists_token_fields() -> io::Result<()> {
    let schema = run_json(&["config", "schema"])?;
    let properties = schema
        .get("properties")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| io::Error::other("schema has no properties"))?;

    for key in ["cpuTokens", "ioTokens", "memoryTokens", "queues", "writeBackpressure"] {
        assert!(properties.contains_key(key), "missing {key}");
    }
    Ok(())
}

#[test]
fn written_artifacts_match_reported_digests() -> io::Result<()> {
    let root = seed_repo("digests")?;
    let out = root.join("index-out");
    let root_arg = root.join("src").to_string_lossy().to_string();
    let out_arg = out.to_string_lossy().to_string();

    let report = run_json(&["index", "--root", &root_arg, "--out", &out_arg])?;
    let digests = report
        .get("build")
        .and_then(|build| build.get("digests"))
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| io::Error::other("missing digests"))?;

    assert!(!digests.is_empty());
    for (name, digest) in digests {
        let bytes = std::fs::read(out.join(name))?;
        assert_eq!(Some(sha256_hex(&bytes).as_str()), digest.as_str(), "{name}");
    }

    std::fs::remove_dir_all(root)?;
    Ok(())
}

#[test]
fn repeated_builds_produce_identical_digests() -> io::Result<()> {
    let root = seed_repo("repeat")?;
    let root_arg = root.to_string_lossy().to_string();

    let combined = |extra: &[&str]| -> io::Result<serde_json::Value> {
        let mut args = vec!["index", "--root", root_arg.as_str()];
        args.extend_from_slice(extra);
        let report = run_json(&args)?;
        report
            .get("build")
            .and_then(|build| build.get("combinedDigest"))
            .cloned()
            .ok_or_else(|| io::Error::other("missing combinedDigest"))
    };

    let baseline = combined(&[])?;
    for _ in 0..3 {
        assert_eq!(combined(&[])?, baseline);
    }
    assert_eq!(
        combined(&["--overrides-json", r#"{"cpuTokens":8,"ioTokens":4,"memoryTokens":2}"#])?,
        baseline
    );
    assert_eq!(combined(&["--no-overlap"])?, baseline);

    std::fs::remove_dir_all(root)?;
    Ok(())
}

#[test]
fn incremental_builds_add_bundle_artifacts() -> io::Result<()> {
    let root = seed_repo("incremental")?;
    let root_arg = root.to_string_lossy().to_string();

    let report = cli()
        .args(["--output", "json", "index", "--root", root_arg.as_str()])
        .env("PAIROFCLEATS_INCREMENTAL", "true")
        .output()?;
    assert!(report.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&report.stdout).map_err(io::Error::other)?;
    let build = value
        .get("build")
        .ok_or_else(|| io::Error::other("missing build"))?;

    let digests = build
        .get("digests")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| io::Error::other("missing digests"))?;
    assert!(digests.contains_key("incremental/vfs_manifest.jsonl"));
    assert!(digests.contains_key("incremental/bundle_index.json"));

    let prefetch = build
        .get("overlap")
        .and_then(|overlap| overlap.get("vfsPrefetch"))
        .and_then(serde_json::Value::as_str);
    assert_eq!(prefetch, Some("joined"));

    std::fs::remove_dir_all(root)?;
    Ok(())
}
