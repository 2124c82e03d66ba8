// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

///
/// A path relative to the build root, with `.` components removed and `..` components
/// resolved. Absolute paths and paths which escape the build root are rejected.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, String> {
        let mut relative_path = PathBuf::new();
        let candidate = path.as_ref();
        for component in candidate.components() {
            match component {
                Component::Prefix(_) => {
                    return Err(format!("Windows paths are not allowed: {candidate:?}"))
                }
                Component::RootDir => {
                    return Err(format!("Absolute paths are not allowed: {candidate:?}"))
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    if !relative_path.pop() {
                        return Err(format!(
                            "Relative paths that escape the root are not allowed: {candidate:?}"
                        ));
                    }
                }
                Component::Normal(path) => relative_path.push(path),
            }
        }
        Ok(RelativePath(relative_path))
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        self.0.as_path()
    }
}

///
/// Requests the content of the file at `path`, relative to the build root. The path is
/// normalized when the request is executed, so `./a.txt` and `a.txt` read the same file.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReadFileRequest {
    pub path: PathBuf,
}

impl ReadFileRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FileContent {
    pub path: PathBuf,
    pub content: Bytes,
    pub is_executable: bool,
}

///
/// Requests a listing of the directory at `path`, relative to the build root. The build root
/// itself is the empty path.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ScandirRequest {
    pub path: PathBuf,
}

impl ScandirRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

///
/// The type of a directory entry, and its path relative to the build root. Symlinks are not
/// expanded.
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Stat {
    Dir(PathBuf),
    File(PathBuf),
    Link(PathBuf),
}

impl Stat {
    pub fn path(&self) -> &Path {
        match self {
            Stat::Dir(path) | Stat::File(path) | Stat::Link(path) => path.as_path(),
        }
    }
}

///
/// The entries of a directory, sorted by path.
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct DirectoryListing(pub Vec<Stat>);

impl DirectoryListing {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.0.iter().map(|stat| stat.path())
    }
}

///
/// Reads a directory (generally in one syscall), relativizing its entries to the build root.
///
pub(crate) async fn scandir(build_root: &Path, dir: &Path) -> Result<DirectoryListing, String> {
    let abs_dir = build_root.join(dir);
    let mut read_dir = tokio::fs::read_dir(&abs_dir)
        .await
        .map_err(|e| format!("Failed to scan directory {}: {e}", abs_dir.display()))?;

    let mut stats = Vec::new();
    while let Some(dir_entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| format!("Failed to scan directory {}: {e}", abs_dir.display()))?
    {
        let file_type = dir_entry.file_type().await.map_err(|e| {
            format!(
                "Failed to stat {}: {e}",
                dir_entry.path().display()
            )
        })?;
        let path = dir.join(dir_entry.file_name());
        let stat = if file_type.is_symlink() {
            Stat::Link(path)
        } else if file_type.is_dir() {
            Stat::Dir(path)
        } else {
            Stat::File(path)
        };
        stats.push(stat);
    }
    stats.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(DirectoryListing(stats))
}

pub(crate) async fn read_file(build_root: &Path, path: &Path) -> Result<FileContent, String> {
    let abs_path = build_root.join(path);
    let content = tokio::fs::read(&abs_path)
        .await
        .map_err(|e| format!("Failed to read file {}: {e}", abs_path.display()))?;
    let metadata = tokio::fs::metadata(&abs_path)
        .await
        .map_err(|e| format!("Failed to stat {}: {e}", abs_path.display()))?;
    Ok(FileContent {
        path: path.to_path_buf(),
        content: Bytes::from(content),
        is_executable: is_executable(&metadata),
    })
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 == 0o100
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
