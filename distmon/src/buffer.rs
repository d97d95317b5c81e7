//! The on-disk buffer of measurement records awaiting upload.
//!
//! The buffer is a directory holding one file per record, named by the record's timestamp, and
//! any in-flight batch artifacts, named `{timestamp}-{installation}`. It is shared by every run
//! of the program, so each write lands atomically (temporary file then rename) and nothing is
//! kept in memory between operations. At most one process may use a buffer directory at a
//! time: there is no locking, callers must serialize runs.

use std::fs;
use std::io;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use log::debug;
use thiserror::Error;

/// Name suffix of files being written, before they are renamed into place
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Refusing to use '{}' as the buffer directory", .0.display())]
    UnsafeRoot(PathBuf),
    #[error("Buffer I/O error on '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BufferError + '_ {
    move |source| BufferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve `.` and `..` by spelling alone, without touching the disk, so that a path that
/// does not exist yet still resolves to where it would land.
fn lexical_normal(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = vec![];
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                // `..` of the root is the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            _ => parts.push(component),
        }
    }
    parts.iter().collect()
}

/// True for directories that must never be used as the buffer: empty, the filesystem root,
/// the current directory and the home directory, however they are spelled.
pub fn is_unsafe_root(path: &Path) -> bool {
    let normal = lexical_normal(path);
    let components: Vec<Component> = normal.components().collect();

    match components.as_slice() {
        [] | [Component::RootDir] | [Component::Prefix(_), Component::RootDir] => return true,
        [Component::Normal(name)] if name.to_str() == Some("~") => return true,
        _ => {}
    }

    // A path spelled differently may still resolve to one of them
    if let Ok(resolved) = path.canonicalize() {
        if resolved.parent().is_none() {
            return true;
        }
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let current = std::env::current_dir().ok();
        for dangerous in [home, current].into_iter().flatten() {
            if dangerous.canonicalize().ok().as_ref() == Some(&resolved) {
                return true;
            }
        }
    }

    false
}

/// True for `{timestamp}-{installation}`, whichever installation made the batch
fn is_batch_name(name: &str) -> bool {
    match name.split_once('-') {
        Some((timestamp, installation)) => {
            !timestamp.is_empty()
                && timestamp.chars().all(|c| c.is_ascii_digit())
                && !installation.is_empty()
        }
        None => false,
    }
}

pub struct BufferStore {
    root: PathBuf,
    batch_suffix: String,
}

impl BufferStore {
    /// Open the buffer in `root`, creating the directory if needed. Batches made here are
    /// named `{timestamp}-{installation}`.
    pub fn open(root: &Path, installation: &str) -> Result<Self, BufferError> {
        if is_unsafe_root(root) {
            return Err(BufferError::UnsafeRoot(root.to_path_buf()));
        }

        fs::create_dir_all(root).map_err(io_error(root))?;

        // Links may still lead somewhere that must not be used
        let resolved = root.canonicalize().map_err(io_error(root))?;
        if is_unsafe_root(&resolved) {
            return Err(BufferError::UnsafeRoot(root.to_path_buf()));
        }

        Ok(BufferStore {
            root: resolved,
            batch_suffix: format!("-{installation}"),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Batches are recognised whatever installation named them, so a batch left in flight
    /// before the installation id changed is still retried rather than taken for a record.
    pub fn is_batch(&self, name: &str) -> bool {
        is_batch_name(name)
    }

    /// Name for a batch made at `timestamp` by this installation
    pub fn batch_name(&self, timestamp: u64) -> String {
        format!("{timestamp}{}", self.batch_suffix)
    }

    /// Names of the regular files in the buffer, sorted, skipping unfinished writes
    fn entries(&self) -> Result<Vec<String>, BufferError> {
        let mut names = vec![];
        for entry in fs::read_dir(&self.root).map_err(io_error(&self.root))? {
            let entry = entry.map_err(io_error(&self.root))?;
            let file_type = entry.file_type().map_err(io_error(&entry.path()))?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && !name.ends_with(PARTIAL_SUFFIX) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Keys of the stored records, not including in-flight batches
    pub fn list_records(&self) -> Result<Vec<String>, BufferError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|name| !self.is_batch(name))
            .collect())
    }

    /// Names of batches that have not been confirmed uploaded
    pub fn list_batches(&self) -> Result<Vec<String>, BufferError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|name| self.is_batch(name))
            .collect())
    }

    /// Bytes used by stored records, not including in-flight batches
    pub fn total_size(&self) -> Result<u64, BufferError> {
        let mut total = 0;
        for key in self.list_records()? {
            let path = self.path(&key);
            total += fs::metadata(&path).map_err(io_error(&path))?.len();
        }
        Ok(total)
    }

    pub fn is_full(&self, ceiling: u64) -> Result<bool, BufferError> {
        Ok(self.total_size()? > ceiling)
    }

    pub fn should_consolidate(&self, threshold: u64) -> Result<bool, BufferError> {
        Ok(self.total_size()? > threshold)
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>, BufferError> {
        let path = self.path(key);
        fs::read(&path).map_err(io_error(&path))
    }

    /// Store `content` under `key`, replacing any previous content. The file appears
    /// complete or not at all.
    pub fn write(&self, key: &str, content: &[u8]) -> Result<(), BufferError> {
        let path = self.path(key);
        let partial = self.path(&format!(".{key}{PARTIAL_SUFFIX}"));

        let mut file = fs::File::create(&partial).map_err(io_error(&partial))?;
        file.write_all(content).map_err(io_error(&partial))?;
        file.sync_all().map_err(io_error(&partial))?;
        drop(file);

        fs::rename(&partial, &path).map_err(io_error(&path))?;
        debug!("Wrote {} bytes to '{}'", content.len(), path.display());
        Ok(())
    }

    /// Remove the entry named `key`. Removing something already gone is not an error.
    pub fn remove(&self, key: &str) -> Result<(), BufferError> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed '{}'", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use super::{is_unsafe_root, BufferError, BufferStore};

    #[test]
    fn unsafe_roots() {
        for root in [
            "", "/", ".", "./", "~", "~/", "/.", "./.", "x/..", "/x/..", "./x/../.", "~/..",
            "/x/../..", "a/b/../..",
        ] {
            assert!(is_unsafe_root(Path::new(root)), "'{root}' should be refused");
        }
    }

    #[test]
    fn home_is_unsafe() {
        if let Some(home) = std::env::var_os("HOME") {
            if Path::new(&home).exists() {
                assert!(is_unsafe_root(Path::new(&home)));
            }
        }
    }

    #[test]
    fn safe_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_unsafe_root(&dir.path().join("buffer")));
        assert!(!is_unsafe_root(Path::new("/tmp/dist-wifi-mon")));
    }

    #[test]
    fn refuses_unsafe_root_without_touching_it() {
        for root in ["", "/", ".", "~"] {
            assert!(matches!(
                BufferStore::open(Path::new(root), "kitchen"),
                Err(BufferError::UnsafeRoot(_))
            ));
        }
        assert!(!Path::new("~").exists());
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("buffer");
        let store = BufferStore::open(&root, "kitchen").unwrap();
        assert!(root.is_dir());
        assert!(store.list_records().unwrap().is_empty());
        assert_eq!(store.total_size().unwrap(), 0);
    }

    #[test]
    fn records_and_batches_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open(dir.path(), "kitchen").unwrap();
        store.write("1700000100", b"abc\n").unwrap();
        store.write("1700000000", b"defgh\n").unwrap();
        store
            .write(&store.batch_name(1700000050), b"a much larger batch\n")
            .unwrap();

        assert_eq!(
            store.list_records().unwrap(),
            vec!["1700000000", "1700000100"]
        );
        assert_eq!(store.list_batches().unwrap(), vec!["1700000050-kitchen"]);
        assert_eq!(store.total_size().unwrap(), 10);
        assert!(store.should_consolidate(9).unwrap());
        assert!(!store.should_consolidate(10).unwrap());
        assert!(store.is_full(9).unwrap());
        assert!(!store.is_full(10).unwrap());
    }

    #[test]
    fn unfinished_writes_and_directories_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open(dir.path(), "kitchen").unwrap();
        fs::write(dir.path().join(".1700000000.partial"), b"half a li").unwrap();
        fs::create_dir(dir.path().join("1700000001")).unwrap();
        assert!(store.list_records().unwrap().is_empty());
        assert_eq!(store.total_size().unwrap(), 0);
    }

    #[test]
    fn write_replaces_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open(dir.path(), "kitchen").unwrap();
        store.write("1700000000", b"first\n").unwrap();
        store.write("1700000000", b"second\n").unwrap();
        assert_eq!(store.read("1700000000").unwrap(), b"second\n");

        store.remove("1700000000").unwrap();
        store.remove("1700000000").unwrap();
        assert!(store.list_records().unwrap().is_empty());
        assert!(matches!(
            store.read("1700000000"),
            Err(BufferError::Io { .. })
        ));
    }

    #[test]
    fn parent_of_missing_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        assert!(is_unsafe_root(Path::new("distmon-missing-dir/..")));
        assert!(is_unsafe_root(Path::new("/distmon-missing-dir/..")));
        assert!(matches!(
            BufferStore::open(Path::new("distmon-missing-dir/.."), "kitchen"),
            Err(BufferError::UnsafeRoot(_))
        ));
        assert!(!Path::new("distmon-missing-dir").exists());

        // Stepping back inside a safe directory is fine
        let store = BufferStore::open(&dir.path().join("sub/../buffer"), "kitchen").unwrap();
        assert_eq!(
            store.root(),
            dir.path().canonicalize().unwrap().join("buffer")
        );
    }

    #[test]
    fn batches_of_any_installation_are_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open(dir.path(), "kitchen").unwrap();
        store.write("1700000000", b"record\n").unwrap();
        store.write("1699999000-oldmachineid", b"record\n").unwrap();
        store.write("1700000050-kitchen", b"record\n").unwrap();

        assert_eq!(store.list_records().unwrap(), vec!["1700000000"]);
        assert_eq!(
            store.list_batches().unwrap(),
            vec!["1699999000-oldmachineid", "1700000050-kitchen"]
        );
        assert_eq!(store.total_size().unwrap(), 7);
    }
}
