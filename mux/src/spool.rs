//! Temporary storage for the message body, replayable per backend

use std::io::{self, SeekFrom};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// How many bytes one replayed body frame carries
pub const SPOOL_CHUNK_SIZE: usize = 64 * 1024;

/// Append-and-replay storage for body bytes.
///
/// Bytes are appended as they arrive from the MTA and read back in
/// [`SPOOL_CHUNK_SIZE`] chunks, once per backend that still needs the body.
#[async_trait]
pub trait BodySpool: Send {
    /// Append `chunk` at the end
    ///
    /// # Errors
    /// If the backing store refuses the write.
    async fn append(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Position the read side back at the first byte
    ///
    /// # Errors
    /// If the backing store cannot seek.
    async fn rewind(&mut self) -> io::Result<()>;

    /// Read the next chunk, `None` once the end is reached
    ///
    /// # Errors
    /// If the backing store refuses the read.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;

    /// Drop all stored bytes
    ///
    /// # Errors
    /// If the backing store cannot be truncated.
    async fn clear(&mut self) -> io::Result<()>;
}

/// The production spool: an unlinked temporary file in the system temp
/// directory, gone as soon as it is dropped
pub struct FileSpool {
    file: File,
}

impl FileSpool {
    /// Create an empty spool file
    ///
    /// # Errors
    /// If the system temp directory refuses us a file.
    pub fn create() -> io::Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            file: File::from_std(file),
        })
    }
}

#[async_trait]
impl BodySpool for FileSpool {
    async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0)).await?;
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buffer = BytesMut::zeroed(SPOOL_CHUNK_SIZE);
        let read = self.file.read(&mut buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        Ok(Some(buffer.freeze()))
    }

    async fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0).await?;
        self.rewind().await
    }
}

/// An in-memory spool for tests and tiny messages
#[derive(Debug, Default)]
pub struct MemSpool {
    bytes: Vec<u8>,
    position: usize,
}

impl MemSpool {
    /// An empty in-memory spool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BodySpool for MemSpool {
    async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    async fn rewind(&mut self) -> io::Result<()> {
        self.position = 0;
        Ok(())
    }

    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.position >= self.bytes.len() {
            return Ok(None);
        }
        let end = (self.position + SPOOL_CHUNK_SIZE).min(self.bytes.len());
        let chunk = Bytes::copy_from_slice(&self.bytes[self.position..end]);
        self.position = end;
        Ok(Some(chunk))
    }

    async fn clear(&mut self) -> io::Result<()> {
        self.bytes.clear();
        self.position = 0;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn roundtrip(spool: &mut dyn BodySpool) {
        spool.append(b"first ").await.expect("append");
        spool.append(b"second").await.expect("append");

        for _replay in 0..2 {
            spool.rewind().await.expect("rewind");
            let mut collected = Vec::new();
            while let Some(chunk) = spool.next_chunk().await.expect("read") {
                collected.extend_from_slice(&chunk);
            }
            assert_eq!(collected, b"first second");
        }

        spool.clear().await.expect("clear");
        assert!(spool.next_chunk().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn mem_spool_replays() {
        roundtrip(&mut MemSpool::new()).await;
    }

    #[tokio::test]
    async fn file_spool_replays() {
        let mut spool = FileSpool::create().expect("temp file");
        roundtrip(&mut spool).await;
    }

    #[tokio::test]
    async fn mem_spool_chunks_large_bodies() {
        let mut spool = MemSpool::new();
        let body = vec![b'x'; SPOOL_CHUNK_SIZE + 17];
        spool.append(&body).await.expect("append");
        spool.rewind().await.expect("rewind");

        let first = spool.next_chunk().await.expect("read").expect("chunk");
        assert_eq!(first.len(), SPOOL_CHUNK_SIZE);
        let second = spool.next_chunk().await.expect("read").expect("chunk");
        assert_eq!(second.len(), 17);
        assert!(spool.next_chunk().await.expect("read").is_none());
    }
}
