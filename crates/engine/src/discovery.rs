//! Suite discovery.
//!
//! Walks a directory tree for suite files (`.yaml`, `.yml`, `.json`), parses
//! each one, and produces the [`DiscoveredTest`] records the dependency
//! resolver builds its graph from. Directory entries are visited in sorted
//! order so discovery order, and therefore execution tie-breaking, is stable
//! across runs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;
use trellis_types::DiscoveredTest;
use trellis_util::normalize_lexically;

use crate::parse_suite_file;

const SUITE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Recursively discovers suite files under `root`.
///
/// Each suite becomes one [`DiscoveredTest`]. The node id is the suite's
/// explicit `node_id` when present, otherwise the file stem; a second suite in
/// the same file must declare its own `node_id`. Duplicate node ids across the
/// tree are an error.
pub fn discover_suites(root: &Path) -> Result<Vec<DiscoveredTest>> {
    let mut files = Vec::new();
    collect_suite_files(root, &mut files)
        .with_context(|| format!("failed to scan suite directory '{}'", root.display()))?;
    files.sort();

    let mut discovered: Vec<DiscoveredTest> = Vec::new();
    for path in files {
        let bundle = parse_suite_file(&path).with_context(|| format!("failed to load suite file '{}'", path.display()))?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .unwrap_or_default();

        for (position, suite) in bundle.suites.values().enumerate() {
            let node_id = match (&suite.node_id, position) {
                (Some(explicit), _) => explicit.clone(),
                (None, 0) => stem.clone(),
                (None, _) => bail!(
                    "suite '{}' in '{}' must declare a node_id; only the first suite in a file may default to the file stem",
                    suite.suite,
                    path.display()
                ),
            };
            if let Some(existing) = discovered.iter().find(|test| test.node_id == node_id) {
                bail!(
                    "duplicate node id '{}': declared by both '{}' and '{}'",
                    node_id,
                    existing.file_path.display(),
                    path.display()
                );
            }
            debug!(node = %node_id, file = %path.display(), "discovered suite");
            discovered.push(DiscoveredTest {
                node_id,
                suite_name: suite.suite.clone(),
                file_path: normalize_lexically(&path),
                depends_on: suite.depends_on.clone(),
                exports: suite.exports.clone(),
                optional_exports: suite.optional_exports.clone(),
            });
        }
    }
    Ok(discovered)
}

fn collect_suite_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_suite_files(&path, files)?;
        } else if path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| SUITE_EXTENSIONS.contains(&extension))
        {
            files.push(path);
        }
    }
    Ok(())
}
