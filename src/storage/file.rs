//! File system storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, ShardsnapError};
use crate::storage::traits::{Storage, StorageError, StorageInput, StorageOutput};

/// A storage backend over a directory tree.
///
/// Names with `/` separators map to nested directories under the root.
/// Parent directories are created on demand when an output is opened.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    closed: bool,
}

impl FileStorage {
    /// Create a file storage rooted at the given directory, creating it if
    /// it does not exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileStorage {
            root,
            closed: false,
        })
    }

    /// The root directory of this storage.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.split('/').any(|part| part.is_empty() || part == ".." || part == ".") {
            return Err(ShardsnapError::invalid_argument(format!(
                "invalid storage file name: {name}"
            )));
        }
        Ok(self.root.join(name))
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                file_name
            } else {
                format!("{prefix}/{file_name}")
            };
            if entry.file_type()?.is_dir() {
                self.walk(&entry.path(), &relative, out)?;
            } else {
                out.push(relative);
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let path = self.resolve(name)?;
        let file = File::open(&path)
            .map_err(|_| StorageError::FileNotFound(name.to_string()))?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileInput { file, size }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Box::new(FileOutput {
            writer: Some(BufWriter::new(file)),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed {
            return false;
        }
        match self.resolve(name) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let path = self.resolve(name)?;
        if path.is_file() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut names = Vec::new();
        self.walk(&self.root, "", &mut names)?;
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let path = self.resolve(name)?;
        let metadata =
            fs::metadata(&path).map_err(|_| StorageError::FileNotFound(name.to_string()))?;
        Ok(metadata.len())
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct FileInput {
    file: File,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct FileOutput {
    writer: Option<BufWriter<File>>,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::other("output already closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::{read_all, write_all};

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.root(), dir.path());

        write_all(&storage, "a.bin", b"hello").unwrap();
        assert!(storage.file_exists("a.bin"));
        assert_eq!(storage.file_size("a.bin").unwrap(), 5);
        assert_eq!(read_all(&storage, "a.bin").unwrap(), b"hello");
    }

    #[test]
    fn test_nested_names_map_to_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        write_all(&storage, "indices/abc/0/blob", b"data").unwrap();
        assert!(dir.path().join("indices/abc/0/blob").is_file());
        assert_eq!(read_all(&storage, "indices/abc/0/blob").unwrap(), b"data");
    }

    #[test]
    fn test_list_files_recursive_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        write_all(&storage, "b", b"2").unwrap();
        write_all(&storage, "a/x", b"1").unwrap();
        write_all(&storage, "a/y", b"1").unwrap();

        assert_eq!(storage.list_files().unwrap(), vec!["a/x", "a/y", "b"]);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(storage.create_output("../escape").is_err());
        assert!(storage.create_output("a//b").is_err());
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(!storage.file_exists("nope"));
        assert!(storage.open_input("nope").is_err());
        assert!(storage.file_size("nope").is_err());
    }
}
