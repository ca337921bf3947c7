use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};

/// Name of the resume artifact inside a receiver's destination directory.
pub const PARTIAL_FILE_NAME: &str = ".wormhole_transfer.tar.part";

/// The archive bytes received so far for the transfer into one destination.
///
/// Its length is the resume offset; nothing else about the transfer is persisted.
#[derive(Debug, Clone)]
pub struct PartialFile {
    path: PathBuf,
}

impl PartialFile {
    pub fn in_dir(dest: &Path) -> Self {
        Self {
            path: dest.join(PARTIAL_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length, 0 when the file does not exist.
    pub async fn len(&self) -> io::Result<u64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn open_append(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }

    pub async fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_missing_partial_has_zero_len() {
        let dir = tempfile::tempdir().unwrap();
        let partial = PartialFile::in_dir(dir.path());
        assert_eq!(partial.len().await.unwrap(), 0);
        assert!(!partial.path().exists());
        partial.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_accumulates_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let partial = PartialFile::in_dir(dir.path());

        let mut f = partial.open_append().await.unwrap();
        f.write_all(b"abc").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let mut f = partial.open_append().await.unwrap();
        f.write_all(b"de").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        assert_eq!(partial.len().await.unwrap(), 5);
        assert_eq!(std::fs::read(partial.path()).unwrap(), b"abcde");
        assert_eq!(partial.path().file_name().unwrap(), PARTIAL_FILE_NAME);
    }
}
