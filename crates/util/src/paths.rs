//! Lexical path normalization and containment checks.
//!
//! The call sandbox must reject a resolved path that escapes its root before
//! the target file is ever read, so the containment check is purely lexical:
//! `..` and `.` components are folded without touching the filesystem.

use std::path::{Component, Path, PathBuf};

/// Folds `.` and `..` components out of a path without filesystem access.
///
/// Leading `..` components on a relative path are preserved since there is
/// nothing to fold them into; a `..` that would climb above an absolute
/// root is dropped.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => normalized.push(Component::ParentDir),
            },
            other => normalized.push(other),
        }
    }
    normalized
}

/// Whether `candidate` stays within `root` after lexical normalization.
///
/// Both paths are normalized first, so `root/sub/../escape` is judged by its
/// folded form. A candidate equal to the root counts as contained.
pub fn path_is_contained(root: &Path, candidate: &Path) -> bool {
    let root = normalize_lexically(root);
    let candidate = normalize_lexically(candidate);
    candidate.starts_with(&root)
}
