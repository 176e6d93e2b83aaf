//! Shared destination file with positional writes
//!
//! The file is opened once per run and shared by every worker of the
//! download; each worker writes at its own disjoint offsets.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct DestinationFile {
    file: Arc<File>,
    path: PathBuf,
}

impl DestinationFile {
    /// Open (or create) `path` without truncating existing content.
    /// When the size is known the file is extended to it up front.
    pub async fn open(path: &Path, size: Option<u64>) -> io::Result<Self> {
        let owned = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&owned)?;
            if let Some(size) = size {
                if file.metadata()?.len() != size {
                    file.set_len(size)?;
                }
            }
            Ok(file)
        })
        .await
        .map_err(join_error)??;

        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all of `data` at absolute `offset`
    pub async fn write_at(&self, offset: u64, data: bytes::Bytes) -> io::Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
            .await
            .map_err(join_error)?
    }

    /// Flush data to disk
    pub async fn sync(&self) -> io::Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(join_error)?
    }

    pub async fn len(&self) -> io::Result<u64> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || Ok(file.metadata()?.len()))
            .await
            .map_err(join_error)?
    }

    /// Cut the file to `size`, used once an unknown-length stream has ended
    pub async fn truncate(&self, size: u64) -> io::Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.set_len(size))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
