//! Path canonicalization under a fixed root.
//!
//! Client-supplied capture filenames must resolve to a location under the
//! configured data root; symlinks pointing outside of it are rejected. The
//! candidate may name directories that do not exist yet; those are created
//! (only when the caller is going to write) after the longest existing
//! prefix has been resolved and checked.

use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path resolves outside of the data root")]
    NotUnderRoot,
    #[error("path does not exist")]
    DoesNotExist,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolve `candidate` (relative to `root`) to a canonical path under
/// `root`.
///
/// With `must_exist`, a missing file is an error; otherwise missing parent
/// directories are created. An empty candidate or one ending in a
/// separator never names a file and is rejected as not-under-root.
pub fn canonicalize_under(
    root: &Path,
    candidate: &str,
    must_exist: bool,
) -> Result<PathBuf, PathError> {
    if candidate.is_empty() || candidate.ends_with('/') {
        return Err(PathError::NotUnderRoot);
    }

    let root = root.canonicalize()?;

    // Leading separators and parent components must not escape the root;
    // normalize lexically before touching the filesystem.
    let mut rel = PathBuf::new();
    for comp in Path::new(candidate.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(c) => rel.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !rel.pop() {
                    return Err(PathError::NotUnderRoot);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::NotUnderRoot)
            }
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(PathError::NotUnderRoot);
    }

    let full = root.join(&rel);
    match full.canonicalize() {
        Ok(resolved) => {
            if !resolved.starts_with(&root) {
                return Err(PathError::NotUnderRoot);
            }
            return Ok(resolved);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(PathError::Io(e)),
    }

    if must_exist {
        return Err(PathError::DoesNotExist);
    }

    // Resolve the longest existing ancestor, verify it stays inside the
    // root, then create whatever is missing below it.
    let mut existing = full.parent().unwrap_or(&root).to_path_buf();
    let mut missing = vec![full.file_name().map(PathBuf::from).unwrap_or_default()];
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                if !resolved.starts_with(&root) {
                    return Err(PathError::NotUnderRoot);
                }
                let mut out = resolved;
                while missing.len() > 1 {
                    if let Some(seg) = missing.pop() {
                        out.push(seg);
                        std::fs::create_dir(&out)?;
                    }
                }
                if let Some(name) = missing.pop() {
                    out.push(name);
                }
                return Ok(out);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let name = existing
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or(PathError::NotUnderRoot)?;
                missing.push(name);
                if !existing.pop() {
                    return Err(PathError::NotUnderRoot);
                }
            }
            Err(e) => return Err(PathError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_simple_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = canonicalize_under(dir.path(), "runA", false).unwrap();
        assert_eq!(p, dir.path().canonicalize().unwrap().join("runA"));
    }

    #[test]
    fn creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let p = canonicalize_under(dir.path(), "sub/deeper/runA", false).unwrap();
        assert!(p.parent().unwrap().is_dir());
        assert!(p.ends_with("sub/deeper/runA"));
    }

    #[test]
    fn must_exist_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        match canonicalize_under(dir.path(), "nope", true) {
            Err(PathError::DoesNotExist) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_dotdot_escape() {
        let dir = tempfile::tempdir().unwrap();
        match canonicalize_under(dir.path(), "../outside", false) {
            Err(PathError::NotUnderRoot) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_trailing_slash_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            canonicalize_under(dir.path(), "a/", false),
            Err(PathError::NotUnderRoot)
        ));
        assert!(matches!(
            canonicalize_under(dir.path(), "", false),
            Err(PathError::NotUnderRoot)
        ));
    }

    #[test]
    fn rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        match canonicalize_under(root.path(), "link/runA", false) {
            Err(PathError::NotUnderRoot) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
