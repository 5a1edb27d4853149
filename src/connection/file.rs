use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::errors::{FragError, Result};

use super::ResourceConnection;

/// A connection to a local file. The size is resolved when the file is
/// opened; reads seek and fill an exact-size buffer.
pub struct FileConnection {
    file: Mutex<File>,
    path: PathBuf,
    bytes: u64,
}

impl FileConnection {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let bytes = file.metadata().await?.len();
        log::debug!("file: opened {} ({} bytes)", path.display(), bytes);
        Ok(Self {
            file: Mutex::new(file),
            path,
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResourceConnection for FileConnection {
    fn bytes(&self) -> u64 {
        self.bytes
    }

    async fn fetch(&self, lo: u64, hi: u64) -> Result<Bytes> {
        if lo > self.bytes {
            return Err(FragError::OutOfRange {
                position: lo,
                extent: self.bytes,
            });
        }
        // trim at end-of-file when hi was not pre-clamped
        let hi = hi.min(self.bytes).max(lo);
        let mut buf = vec![0u8; (hi - lo) as usize];

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(lo)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
