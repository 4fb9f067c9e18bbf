//! Local publication of the held name.
//!
//! The name file is the only interface other processes on the box see. It is
//! always replaced atomically, so a reader observes either the previous name
//! or the new one, never a partial write.

use parking_lot::Mutex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Writes the held name to a local file.
#[derive(Debug)]
pub struct NamePublisher {
    target: PathBuf,
    lock: Mutex<()>,
}

impl NamePublisher {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Atomically replaces the file with `name` followed by a newline.
    pub fn publish(&self, name: &str) -> io::Result<()> {
        let _guard = self.lock.lock();
        let dir = match self.target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".nameplate")
            .tempfile_in(dir)?;
        writeln!(tmp, "{name}")?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?;
        }
        tmp.persist(&self.target).map_err(|e| e.error)?;

        tracing::debug!(path = %self.target.display(), %name, "published name");
        Ok(())
    }

    /// Removes the file. A file that is already gone is not an error.
    pub fn clear(&self) -> io::Result<()> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Reads a published name.
///
/// Absence, read errors and blank content all mean "no name".
pub fn read_published_name(path: impl AsRef<Path>) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let name = content.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_and_clear_removes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("server_name");
        let publisher = NamePublisher::new(&target);

        publisher.publish("zeus").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "zeus\n");
        assert_eq!(read_published_name(&target).as_deref(), Some("zeus"));

        publisher.publish("hera").unwrap();
        assert_eq!(read_published_name(&target).as_deref(), Some("hera"));

        publisher.clear().unwrap();
        assert!(!target.exists());
        publisher.clear().unwrap();
        assert_eq!(read_published_name(&target), None);
    }

    #[test]
    fn leaves_no_temporary_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = NamePublisher::new(dir.path().join("server_name"));
        publisher.publish("a").unwrap();
        publisher.publish("b").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, ["server_name"]);
    }

    #[cfg(unix)]
    #[test]
    fn published_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("server_name");
        NamePublisher::new(&target).publish("zeus").unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn blank_files_mean_no_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("server_name");
        fs::write(&target, "  \n").unwrap();
        assert_eq!(read_published_name(&target), None);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = NamePublisher::new(dir.path().join("missing").join("server_name"));
        assert!(publisher.publish("zeus").is_err());
    }
}
