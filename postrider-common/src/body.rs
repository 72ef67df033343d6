//! Message body buffers.
//!
//! Bodies move through the system either as an in-memory blob (freshly
//! received or synthesized) or as a file on disk (after the queue has stored
//! them). Both open as a stream so large bodies are never buffered whole when
//! copying between files.

use std::{io, path::PathBuf, pin::Pin, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt};

/// A readable message body.
#[derive(Debug, Clone)]
pub enum BodyBuffer {
    /// Body held in memory; cheap to clone.
    Memory(Arc<[u8]>),
    /// Body backed by a file, re-read on every open.
    File(PathBuf),
}

impl BodyBuffer {
    /// Open the body for reading from the start.
    ///
    /// # Errors
    /// Fails if a file-backed body cannot be opened.
    pub async fn open(&self) -> io::Result<Pin<Box<dyn AsyncRead + Send>>> {
        match self {
            Self::Memory(bytes) => Ok(Box::pin(io::Cursor::new(Arc::clone(bytes)))),
            Self::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::pin(file))
            }
        }
    }

    /// Read the whole body into memory. Intended for tests and bounded
    /// content such as synthesized notifications.
    ///
    /// # Errors
    /// Propagates I/O failures from the underlying source.
    pub async fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.open().await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl From<&[u8]> for BodyBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::Memory(Arc::from(bytes))
    }
}

impl From<Vec<u8>> for BodyBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Memory(Arc::from(bytes))
    }
}
