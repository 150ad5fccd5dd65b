//! Route mapping file loading.
//!
//! The file is JSON, either an object with a `mappings` array or a bare
//! array:
//!
//! ```json
//! { "mappings": [ { "port": 3000, "from": "1000-2000;5", "to": "10.0.0.5:9000" } ] }
//! ```
//!
//! PascalCase keys (`Mappings`, `Port`, `From`, `To`) are accepted too.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{error, info};

use crate::error::RouteError;
use crate::proxy::{RouteSpec, RouteTable};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingsDocument {
    Wrapped {
        #[serde(alias = "Mappings")]
        mappings: Vec<RouteSpec>,
    },
    Bare(Vec<RouteSpec>),
}

/// A mapping that could not be compiled and was left out of the table.
#[derive(Debug)]
pub struct SkippedMapping {
    /// Position in the file, zero-based.
    pub index: usize,
    pub spec: RouteSpec,
    pub error: RouteError,
}

/// Route mappings file.
pub struct MappingsFile {
    path: PathBuf,
}

impl MappingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the mapping specs, in file order.
    pub fn load(&self) -> Result<Vec<RouteSpec>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read mappings file: {}", self.path.display()))?;

        let document: MappingsDocument = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse mappings file: {}", self.path.display())
        })?;

        let specs = match document {
            MappingsDocument::Wrapped { mappings } => mappings,
            MappingsDocument::Bare(mappings) => mappings,
        };

        info!(
            path = %self.path.display(),
            mapping_count = specs.len(),
            "Loaded route mappings"
        );
        Ok(specs)
    }
}

/// Build a route table, skipping mappings that fail to compile.
///
/// A bad mapping only takes down itself; a listen port with no surviving
/// rules simply gets no listener.
pub fn build_route_table(specs: Vec<RouteSpec>) -> (RouteTable, Vec<SkippedMapping>) {
    let mut table = RouteTable::new();
    let mut skipped = Vec::new();

    for (index, spec) in specs.into_iter().enumerate() {
        if let Err(error) = table.add(&spec) {
            error!(
                index,
                from = %spec.from,
                to = %spec.to,
                listen_port = spec.port,
                reason = error.reason_code(),
                error = %error,
                "Skipping route mapping"
            );
            skipped.push(SkippedMapping { index, spec, error });
        }
    }

    info!(
        rule_count = table.len(),
        ports = ?table.ports(),
        skipped = skipped.len(),
        "Route table built"
    );
    (table, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_wrapped_document() {
        let file = write_file(
            r#"{"mappings": [
                {"port": 15000, "from": "1000-1000000", "to": "127.0.0.1:9000"},
                {"from": "*", "to": "127.0.0.1"}
            ]}"#,
        );

        let specs = MappingsFile::new(file.path()).load().unwrap();
        assert_eq!(
            specs,
            vec![
                RouteSpec::new("1000-1000000", "127.0.0.1:9000", 15000),
                RouteSpec::new("*", "127.0.0.1", 3000),
            ]
        );
    }

    #[test]
    fn loads_pascal_case_and_bare_array() {
        let file = write_file(r#"{"Mappings": [{"Port": 4000, "From": "5", "To": "a:1"}]}"#);
        let specs = MappingsFile::new(file.path()).load().unwrap();
        assert_eq!(specs, vec![RouteSpec::new("5", "a:1", 4000)]);

        let file = write_file(r#"[{"from": "6", "to": "b:2"}]"#);
        let specs = MappingsFile::new(file.path()).load().unwrap();
        assert_eq!(specs, vec![RouteSpec::new("6", "b:2", 3000)]);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let file = write_file(r#"{"mappings": [ {"from": 5} ]"#);
        let err = MappingsFile::new(file.path()).load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse mappings file"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MappingsFile::new(dir.path().join("absent.json"))
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read mappings file"));
    }

    #[test]
    fn bad_mappings_are_skipped_not_fatal() {
        let specs = vec![
            RouteSpec::new("1", "127.0.0.1:9001", 3000),
            RouteSpec::new("x", "127.0.0.1:9002", 3000),
            RouteSpec::new("2", "127.0.0.1:port", 4000),
            RouteSpec::new("*", "127.0.0.1:9003", 3000),
            RouteSpec::new("*", "127.0.0.1:9004", 3000),
        ];

        let (table, skipped) = build_route_table(specs);

        let indices: Vec<usize> = skipped.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 4]);
        assert_eq!(table.ports(), vec![3000]);
        assert_eq!(table.lookup(1, 3000), Some("127.0.0.1:9001".parse().unwrap()));
        assert_eq!(table.lookup(9, 3000), Some("127.0.0.1:9003".parse().unwrap()));
    }
}
