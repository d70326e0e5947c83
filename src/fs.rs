//! Filesystem helpers: modification times with "absent" and "unknown"
//! sentinels, existence checks, and removal with a status result rather
//! than an error for the already-gone case.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A file modification time that also models "not stat()ed yet" and
/// "file is absent".  Encoded so the whole domain is totally ordered and
/// fits in an atomic: 0 is unknown, 1 is nonexistent, anything else is
/// nanoseconds since the epoch plus 2.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct FileTime(u64);

impl FileTime {
    pub const UNKNOWN: FileTime = FileTime(0);
    pub const NONEXISTENT: FileTime = FileTime(1);

    pub fn from_raw(raw: u64) -> FileTime {
        FileTime(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn now() -> FileTime {
        FileTime::from_system(SystemTime::now())
    }

    pub fn from_system(t: SystemTime) -> FileTime {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        FileTime(nanos.saturating_add(2))
    }

    pub fn is_known(self) -> bool {
        self != FileTime::UNKNOWN
    }

    pub fn exists(self) -> bool {
        self.0 > 1
    }
}

/// stat() a path, mapping absence to `FileTime::NONEXISTENT`.
pub fn mtime(path: &Path) -> std::io::Result<FileTime> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(FileTime::from_system(meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileTime::NONEXISTENT),
        Err(err) => Err(err),
    }
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

#[derive(Debug, PartialEq, Eq)]
pub enum RmStatus {
    Removed,
    NotExist,
    /// Directories only: present but not empty, left alone.
    NotEmpty,
}

pub fn try_rmfile(path: &Path) -> std::io::Result<RmStatus> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(RmStatus::Removed),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RmStatus::NotExist),
        Err(err) => Err(err),
    }
}

pub fn try_rmdir(path: &Path) -> std::io::Result<RmStatus> {
    match std::fs::remove_dir(path) {
        Ok(()) => Ok(RmStatus::Removed),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RmStatus::NotExist),
        // remove_dir on a non-empty directory surfaces as a generic error
        // with ENOTEMPTY/EEXIST underneath; treat any "still there" case as
        // not empty.
        Err(_) if path.is_dir() => Ok(RmStatus::NotEmpty),
        Err(err) => Err(err),
    }
}

/// Create a directory and any missing parents.  Returns true if anything
/// was created.
pub fn mkdir_p(path: &Path) -> std::io::Result<bool> {
    if dir_exists(path) {
        return Ok(false);
    }
    std::fs::create_dir_all(path)?;
    Ok(true)
}

/// Lexically normalize a path: collapse `.` and `..` components without
/// touching the disk.  Discovered dependency paths come out of tools with
/// `foo/../bar` shapes due to include-path concatenation.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else {
                    out.push("..");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                out.push(c.as_os_str());
            }
            Component::Normal(p) => {
                out.push(p);
                depth += 1;
            }
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_orders_sentinels_before_stamps() {
        assert!(FileTime::UNKNOWN < FileTime::NONEXISTENT);
        assert!(FileTime::NONEXISTENT < FileTime::now());
    }

    #[test]
    fn mtime_of_missing_file() {
        let t = mtime(Path::new("/definitely/not/here.txt")).unwrap();
        assert_eq!(t, FileTime::NONEXISTENT);
        assert!(!t.exists());
    }

    #[test]
    fn normalize_collapses() {
        assert_eq!(normalize(Path::new("a/./b")), PathBuf::from("a/b"));
        assert_eq!(normalize(Path::new("a/../b")), PathBuf::from("b"));
        assert_eq!(normalize(Path::new("/x/y/../z")), PathBuf::from("/x/z"));
        assert_eq!(normalize(Path::new("../a")), PathBuf::from("../a"));
        assert_eq!(normalize(Path::new("a/..")), PathBuf::from("."));
    }

    #[test]
    fn rm_missing_is_not_exist() {
        assert_eq!(
            try_rmfile(Path::new("/definitely/not/here.txt")).unwrap(),
            RmStatus::NotExist
        );
    }
}
