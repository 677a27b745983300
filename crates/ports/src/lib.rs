//! # pairofcleats-ports
//!
//! Port traits between the build engine and its collaborators.
//!
//! This crate defines the interfaces between the scheduling core and the
//! adapters. It depends only on `domain` and `shared`.

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by port traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Returns the ports crate version.
#[must_use]
pub const fn ports_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub mod logger;
pub mod stages;
pub mod telemetry;

pub use logger::*;
pub use stages::*;
pub use telemetry::*;

// Re-export domain types used in port signatures.
pub use pairofcleats_domain::{
    IndexMode, PostingsIndex, ProcessedFile, RelationsOutcome, SourceFile, VfsRow,
};

#[cfg(test)]
mod tests {
    use super::*;
    use pairofcleats_domain::domain_crate_version;
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
                in_deps = line == "[dependencies]" || line == "[dev-dependencies]";
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
    fn ports_depends_only_on_domain_and_shared() {
        let deps = workspace_deps();
        let allowed = ["pairofcleats-domain", "pairofcleats-shared"];

        for dep in &deps {
            assert!(
                allowed.contains(&dep.as_str()),
                "unexpected dependency found: {dep}"
            );
        }
        for expected in allowed {
            assert!(
                deps.iter().any(|dep| dep == expected),
                "missing dependency: {expected}"
            );
        }
    }

    #[test]
    fn ports_crate_compiles() {
        assert!(!ports_crate_version().is_empty());
        assert!(!domain_crate_version().is_empty());
        assert!(!shared_crate_version().is_empty());
    }

    #[test]
    fn relations_request_any() {
        assert!(!RelationsRequest::default().any());
        assert!(
            RelationsRequest {
                cross_file_inference: false,
                import_graph: true,
            }
            .any()
        );
    }
}
