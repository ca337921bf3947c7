//! Tar serialization of a file or directory tree.
//!
//! Packing runs on a blocking thread and hands fixed-size chunks to async code through a
//! bounded channel, so a slow socket backs up into the packer instead of into memory. The
//! stream has no seek support: resuming is done by the caller discarding a prefix.

use std::fs;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tar::{Archive, Builder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::TransferConfig;
use crate::{Error, Result};

const BLOCK_LEN: u64 = 512;

/// tar closes every archive with two zeroed blocks
const END_OF_ARCHIVE_LEN: u64 = 2 * BLOCK_LEN;

/// Writer that cuts the tar output into chunks and sends them through a channel
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    buffer: Vec<u8>,
    chunk_size: usize,
    written: u64,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Bytes>, chunk_size: usize) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            written: 0,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.written += chunk.len() as u64;
            self.tx
                .blocking_send(Bytes::from(chunk))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer gone"))?;
        }
        Ok(())
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            remaining = &remaining[to_write..];

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

/// Serializes a path into an ordered tar byte stream.
///
/// A directory is archived by its contents, so entries are relative to the directory
/// itself. A single file becomes one entry named after the file.
#[derive(Debug, Clone)]
pub struct ArchivePacker {
    source: PathBuf,
    chunk_size: usize,
    channel_buffer: usize,
}

impl ArchivePacker {
    pub fn new(source: impl Into<PathBuf>, config: &TransferConfig) -> Self {
        Self {
            source: source.into(),
            chunk_size: config.chunk_size.max(1),
            channel_buffer: config.channel_buffer.max(1),
        }
    }

    /// Start packing on a blocking thread.
    pub fn spawn(self) -> PackStream {
        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let task = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            let mut writer = ChannelWriter::new(tx, self.chunk_size);
            write_archive(&self.source, &mut writer)?;
            writer.flush()?;
            Ok(writer.written)
        });
        PackStream { rx, task }
    }
}

/// Chunks produced by a running [`ArchivePacker`].
pub struct PackStream {
    rx: mpsc::Receiver<Bytes>,
    task: JoinHandle<io::Result<u64>>,
}

impl PackStream {
    /// Next chunk of archive output, `None` once the packer stopped.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Wait for the packer and return the total archive length.
    ///
    /// Must be called after `next_chunk` returned `None`, otherwise the packer may block on
    /// a full channel.
    pub async fn finish(self) -> Result<u64> {
        drop(self.rx);
        match self.task.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(Error::Io(io::Error::other(format!("archive task failed: {e}")))),
        }
    }
}

/// Write the tar stream for `source` into `out`.
pub fn write_archive<W: Write>(source: &Path, out: W) -> io::Result<W> {
    let mut builder = Builder::new(out);
    builder.follow_symlinks(false);

    let metadata = fs::metadata(source)?;
    if metadata.is_dir() {
        for entry in WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                builder.append_dir(rel, entry.path())?;
            } else if file_type.is_file() || file_type.is_symlink() {
                builder.append_path_with_name(entry.path(), rel)?;
            } else {
                debug!(path = %entry.path().display(), "skipping special file");
            }
        }
    } else {
        let name = source.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "source has no file name")
        })?;
        builder.append_file(name, &mut fs::File::open(source)?)?;
    }

    builder.into_inner()
}

/// Whether the tar stream stored at `path` is whole.
///
/// A clean end-of-stream alone proves nothing, and a cut that happens to land after two
/// zeroed blocks of file content looks like an end marker. So every entry's data must lie
/// inside the file with the end-of-archive marker after the last one.
pub fn is_complete_archive(path: &Path) -> io::Result<bool> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len < END_OF_ARCHIVE_LEN || len % BLOCK_LEN != 0 {
        return Ok(false);
    }

    let mut tail = [0u8; END_OF_ARCHIVE_LEN as usize];
    file.seek(SeekFrom::Start(len - END_OF_ARCHIVE_LEN))?;
    file.read_exact(&mut tail)?;
    if tail.iter().any(|&b| b != 0) {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut ar = Archive::new(BufReader::new(file));
    for entry in ar.entries()? {
        let entry = entry?;
        let data_end = entry.raw_file_position() + entry.size().div_ceil(BLOCK_LEN) * BLOCK_LEN;
        if data_end + END_OF_ARCHIVE_LEN > len {
            debug!(
                path = ?entry.path().ok(),
                data_end,
                len,
                "archive entry runs past the received bytes"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Restores a tar stream into a directory.
#[derive(Debug, Clone)]
pub struct ArchiveUnpacker {
    dest: PathBuf,
}

impl ArchiveUnpacker {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }

    /// Check on a blocking thread that `archive` is complete. See [`is_complete_archive`].
    pub async fn verify_file(&self, archive: &Path) -> Result<bool> {
        let archive_path = archive.to_path_buf();
        let result = tokio::task::spawn_blocking({
            let archive_path = archive_path.clone();
            move || is_complete_archive(&archive_path)
        })
        .await;

        match result {
            Ok(Ok(complete)) => Ok(complete),
            Ok(Err(source)) => Err(Error::Extraction {
                path: archive_path,
                source,
            }),
            Err(e) => Err(Error::Extraction {
                path: archive_path,
                source: io::Error::other(e.to_string()),
            }),
        }
    }

    /// Extract the archive stored at `archive` and return the number of entries written.
    pub async fn unpack_file(&self, archive: &Path) -> Result<u64> {
        let archive_path = archive.to_path_buf();
        let dest = self.dest.clone();

        let result = tokio::task::spawn_blocking({
            let archive_path = archive_path.clone();
            move || -> io::Result<u64> {
                fs::create_dir_all(&dest)?;
                let file = fs::File::open(&archive_path)?;
                let mut ar = Archive::new(BufReader::new(file));
                ar.set_overwrite(true);
                ar.set_preserve_mtime(true);

                let mut entries = 0u64;
                for entry in ar.entries()? {
                    let mut entry = entry?;
                    if entry.unpack_in(&dest)? {
                        entries += 1;
                    } else {
                        debug!(path = ?entry.path().ok(), "skipped entry outside destination");
                    }
                }
                Ok(entries)
            }
        })
        .await;

        match result {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(source)) => Err(Error::Extraction {
                path: archive_path,
                source,
            }),
            Err(e) => Err(Error::Extraction {
                path: archive_path,
                source: io::Error::other(e.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_to_vec(source: &Path) -> Vec<u8> {
        write_archive(source, Vec::new()).unwrap()
    }

    #[test]
    fn test_pack_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.txt"), b"1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/two.txt"), b"22").unwrap();

        assert_eq!(pack_to_vec(dir.path()), pack_to_vec(dir.path()));
    }

    #[test]
    fn test_single_file_entry_is_named_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.md");
        fs::write(&file, b"# hi").unwrap();

        let bytes = pack_to_vec(&file);
        let mut ar = Archive::new(bytes.as_slice());
        let names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["note.md"]);
    }

    #[test]
    fn test_directory_entries_are_relative_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let bytes = pack_to_vec(dir.path());
        let mut ar = Archive::new(bytes.as_slice());
        let names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_pack_stream_matches_sync_archive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.bin"), vec![7u8; 10_000]).unwrap();

        let config = TransferConfig {
            chunk_size: 1000,
            channel_buffer: 2,
            ..TransferConfig::default()
        };
        let mut stream = ArchivePacker::new(dir.path(), &config).spawn();
        let mut streamed = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            assert!(chunk.len() <= 1000);
            streamed.extend_from_slice(&chunk);
        }
        let total = stream.finish().await.unwrap();

        assert_eq!(total, streamed.len() as u64);
        assert_eq!(streamed, pack_to_vec(dir.path()));
    }

    #[tokio::test]
    async fn test_pack_missing_source_fails() {
        let mut stream =
            ArchivePacker::new("/nonexistent/wormhole/source", &TransferConfig::default()).spawn();
        assert!(stream.next_chunk().await.is_none());
        assert!(stream.finish().await.is_err());
    }

    #[test]
    fn test_complete_archive_is_recognised() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let bytes = pack_to_vec(dir.path());
        let path = dir.path().join("whole.tar");
        fs::write(&path, &bytes).unwrap();
        assert!(is_complete_archive(&path).unwrap());

        fs::write(&path, vec![0u8; 1024]).unwrap();
        assert!(is_complete_archive(&path).unwrap());
    }

    #[test]
    fn test_cut_inside_zeroed_file_content_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let mut content = vec![1u8; 512];
        content.extend_from_slice(&[0u8; 4096]);
        content.extend_from_slice(&[2u8; 512]);
        fs::write(src.join("holey.bin"), &content).unwrap();
        let bytes = pack_to_vec(&src);

        // Header, the first data block and two zeroed data blocks: ends like an archive.
        let cut = &bytes[..512 + 512 + 1024];
        assert!(cut[cut.len() - 1024..].iter().all(|&b| b == 0));
        let path = dir.path().join("cut.tar");
        fs::write(&path, cut).unwrap();
        assert!(!is_complete_archive(&path).unwrap());

        // Every entry present but no end marker.
        fs::write(&path, &bytes[..bytes.len() - 1024]).unwrap();
        assert!(!is_complete_archive(&path).unwrap());

        let mut unaligned = bytes.clone();
        unaligned.push(0);
        fs::write(&path, unaligned).unwrap();
        assert!(!is_complete_archive(&path).unwrap());
    }

    #[tokio::test]
    async fn test_unpack_garbage_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tar");
        fs::write(&archive, vec![0xffu8; 700]).unwrap();

        let err = ArchiveUnpacker::new(dir.path().join("out"))
            .unpack_file(&archive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));
    }
}
