//! Recursive directory scanning with path exclusions via the `ignore` crate

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::snapshot::{FileInfo, relative_path};

/// Directory name that is never scanned, watched or synced
pub const GIT_DIR: &str = ".git";

/// Gitignore-style exclusion rules, evaluated relative to the sync root
#[derive(Debug, Clone)]
pub struct Exclusions {
    root: PathBuf,
    matcher: Gitignore,
}

impl Exclusions {
    /// Compile `patterns` (gitignore syntax) for the tree rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if a pattern is not a valid glob.
    pub fn new(root: impl Into<PathBuf>, patterns: &[String]) -> Result<Self> {
        let root = root.into();
        let mut builder = GitignoreBuilder::new(&root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .wrap_err_with(|| format!("invalid ignore pattern {pattern:?}"))?;
        }
        let matcher = builder.build()?;
        Ok(Self { root, matcher })
    }

    /// No exclusions beyond `.git`
    #[must_use]
    pub fn none(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            matcher: Gitignore::empty(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute, under the root) or any of its parents is
    /// excluded
    #[must_use]
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return true;
        };
        if rel.as_os_str().is_empty() {
            return false;
        }
        if rel.components().any(|c| c.as_os_str() == GIT_DIR) {
            return true;
        }
        self.matcher
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }
}

/// Walk `start` (the sync root or a directory below it) without following
/// symlinks.
///
/// `on_dir` is invoked for every directory, `start` included, before its
/// children are read; an error from it aborts the walk. Regular files and
/// symlinks are returned with their lstat metadata, keyed relative to the
/// exclusion root.
///
/// # Errors
/// Returns an error if traversal, stat or `on_dir` fails.
pub fn scan_tree(
    start: &Path,
    exclusions: &Exclusions,
    mut on_dir: impl FnMut(&Path) -> Result<()>,
) -> Result<Vec<(String, FileInfo)>> {
    let filter = exclusions.clone();
    let mut builder = WalkBuilder::new(start);
    builder
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !filter.is_excluded(entry.path(), is_dir)
        });

    let mut files = Vec::new();
    for result in builder.build() {
        let entry = result?;
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();

        if file_type.is_dir() {
            on_dir(path)?;
            continue;
        }
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }

        let Some(rel) = relative_path(exclusions.root(), path) else {
            continue;
        };
        let metadata = entry
            .metadata()
            .wrap_err_with(|| format!("failed to stat {}", path.display()))?;
        files.push((rel, FileInfo::from_metadata(&metadata)));
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scan_paths(root: &Path, exclusions: &Exclusions) -> (Vec<String>, Vec<PathBuf>) {
        let mut dirs = Vec::new();
        let files = scan_tree(root, exclusions, |dir| {
            dirs.push(dir.to_path_buf());
            Ok(())
        })
        .unwrap();
        let mut paths: Vec<_> = files.into_iter().map(|(p, _)| p).collect();
        paths.sort();
        dirs.sort();
        (paths, dirs)
    }

    #[test]
    fn test_scan_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let (paths, dirs) = scan_paths(dir.path(), &Exclusions::none(dir.path()));

        assert_eq!(paths, vec!["root.txt", "sub/dir/deep.txt", "sub/nested.txt"]);
        assert_eq!(
            dirs,
            vec![
                dir.path().to_path_buf(),
                dir.path().join("sub"),
                dir.path().join("sub/dir")
            ]
        );
    }

    #[test]
    fn test_scan_records_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, vec![0u8; 100]).unwrap();
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_700_000_000, 0))
            .unwrap();

        let files = scan_tree(dir.path(), &Exclusions::none(dir.path()), |_| Ok(())).unwrap();
        assert_eq!(files, vec![("a.txt".to_string(), FileInfo::new(100, 1_700_000_000))]);
    }

    #[test]
    fn test_scan_skips_git_and_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/app"), "bin").unwrap();
        fs::write(dir.path().join("notes.swp"), "swap").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();

        let exclusions =
            Exclusions::new(dir.path(), &["target/".to_string(), "*.swp".to_string()]).unwrap();
        let (paths, dirs) = scan_paths(dir.path(), &exclusions);

        assert_eq!(paths, vec!["keep.txt"]);
        assert_eq!(dirs, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn test_scan_subtree_keys_relative_to_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), "c").unwrap();

        let exclusions = Exclusions::none(dir.path());
        let (paths, _) = scan_paths(&dir.path().join("a"), &exclusions);
        assert_eq!(paths, vec!["a/b/c.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_keeps_symlinks_unfollowed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/file.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();

        let (paths, dirs) = scan_paths(dir.path(), &Exclusions::none(dir.path()));
        assert_eq!(paths, vec!["link", "real/file.txt"]);
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn test_on_dir_error_aborts() {
        let dir = TempDir::new().unwrap();
        let result = scan_tree(dir.path(), &Exclusions::none(dir.path()), |_| {
            color_eyre::eyre::bail!("watch limit reached")
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(Exclusions::new(dir.path(), &["{a".to_string()]).is_err());
    }
}
