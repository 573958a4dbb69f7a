/*!
 * Source discovery: turn a file or directory tree into file descriptors
 */

use std::path::{Component, Path};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::types::{FileDescriptor, SourceLocation};
use crate::error::{FreightError, Result};

/// Collect every regular file under `root`
///
/// Destination keys are `prefix/relative/path` with `/` separators. A file
/// root yields a single descriptor keyed by its file name. Symlinks are not
/// followed.
pub fn discover(root: &Path, prefix: Option<&str>) -> Result<Vec<FileDescriptor>> {
    let metadata = std::fs::metadata(root).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FreightError::SourceNotFound(root.to_path_buf())
        } else {
            FreightError::Io(e)
        }
    })?;
    let prefix = normalize_prefix(prefix);

    if metadata.is_file() {
        let name = root
            .file_name()
            .ok_or_else(|| FreightError::SourceNotFound(root.to_path_buf()))?
            .to_string_lossy();
        let key = join_key(prefix.as_deref(), &name);
        return Ok(vec![FileDescriptor::from_path(root, key)?]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| FreightError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| FreightError::InvalidDestination(entry.path().display().to_string()))?;
        let key = join_key(prefix.as_deref(), &relative_key(relative));
        let size = entry.metadata().map_err(|e| FreightError::Io(e.into()))?.len();

        debug!(path = %entry.path().display(), key = %key, size, "Discovered file");
        files.push(FileDescriptor::new(
            SourceLocation::Path(entry.path().to_path_buf()),
            size,
            key,
        ));
    }

    info!(root = %root.display(), files = files.len(), "Discovery complete");
    Ok(files)
}

fn normalize_prefix(prefix: Option<&str>) -> Option<String> {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn join_key(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"bb").unwrap();
        fs::write(dir.path().join("sub/deeper/c.bin"), b"c").unwrap();

        let files = discover(dir.path(), None).unwrap();
        let mut keys: Vec<(&str, u64)> = files.iter().map(|f| (f.dest_key(), f.size())).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![("a.txt", 3), ("sub/b.txt", 2), ("sub/deeper/c.bin", 1)]
        );
    }

    #[test]
    fn test_discover_with_prefix() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"x").unwrap();

        let files = discover(dir.path(), Some("/releases/v1/")).unwrap();
        assert_eq!(files[0].dest_key(), "releases/v1/x.txt");
    }

    #[test]
    fn test_discover_single_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("only.dat");
        fs::write(&path, b"12345").unwrap();

        let files = discover(&path, Some("drop")).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].dest_key(), "drop/only.dat");
        assert_eq!(files[0].size(), 5);
    }

    #[test]
    fn test_discover_missing_root() {
        let dir = tempdir().unwrap();
        let err = discover(&dir.path().join("nope"), None).unwrap_err();
        assert!(matches!(err, FreightError::SourceNotFound(_)));
    }

    #[test]
    fn test_empty_prefix_ignored() {
        assert_eq!(normalize_prefix(Some("//")), None);
        assert_eq!(normalize_prefix(Some("a/b/")), Some("a/b".to_string()));
        assert_eq!(normalize_prefix(None), None);
    }
}
