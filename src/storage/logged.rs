// Logging decorator for any blob store; results pass through untouched.
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::{BlobStore, BlobWriter};
use crate::core::error::Error;

#[derive(Clone)]
pub struct LoggedStore {
    inner: Arc<dyn BlobStore>,
}

impl LoggedStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self { inner }
    }
}

impl BlobStore for LoggedStore {
    fn read(&self, key: &str) -> Result<Bytes, Error> {
        match self.inner.read(key) {
            Ok(content) => {
                debug!(key, len = content.len(), "storage read");
                Ok(content)
            }
            Err(err) => {
                debug!(key, %err, "storage read failed");
                Err(err)
            }
        }
    }

    fn read_streaming(&self, key: &str) -> Result<Box<dyn Read + Send>, Error> {
        match self.inner.read_streaming(key) {
            Ok(reader) => {
                debug!(key, "storage read_streaming");
                Ok(Box::new(LoggedReader {
                    inner: reader,
                    key: key.to_string(),
                    total: 0,
                }))
            }
            Err(err) => {
                debug!(key, %err, "storage read_streaming failed");
                Err(err)
            }
        }
    }

    fn save(&self, key: &str, content: &[u8]) -> Result<(), Error> {
        match self.inner.save(key, content) {
            Ok(()) => {
                debug!(key, len = content.len(), "storage save");
                Ok(())
            }
            Err(err) => {
                debug!(key, %err, "storage save failed");
                Err(err)
            }
        }
    }

    fn save_streaming(&self, key: &str) -> Result<Box<dyn BlobWriter>, Error> {
        match self.inner.save_streaming(key) {
            Ok(writer) => {
                debug!(key, "storage save_streaming");
                Ok(Box::new(LoggedWriter {
                    inner: writer,
                    key: key.to_string(),
                    total: 0,
                }))
            }
            Err(err) => {
                debug!(key, %err, "storage save_streaming failed");
                Err(err)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        match self.inner.delete(key) {
            Ok(()) => {
                debug!(key, "storage delete");
                Ok(())
            }
            Err(err) => {
                debug!(key, %err, "storage delete failed");
                Err(err)
            }
        }
    }
}

struct LoggedReader {
    inner: Box<dyn Read + Send>,
    key: String,
    total: usize,
}

impl Read for LoggedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) => {
                debug!(key = %self.key, total = self.total, "storage stream drained");
                Ok(0)
            }
            Ok(n) => {
                self.total += n;
                Ok(n)
            }
            Err(err) => {
                debug!(key = %self.key, %err, "storage stream read failed");
                Err(err)
            }
        }
    }
}

struct LoggedWriter {
    inner: Box<dyn BlobWriter>,
    key: String,
    total: usize,
}

impl Write for LoggedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf).inspect_err(|err| {
            debug!(key = %self.key, %err, "storage stream write failed");
        })?;
        self.total += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BlobWriter for LoggedWriter {
    fn commit(self: Box<Self>) -> Result<(), Error> {
        let LoggedWriter { inner, key, total } = *self;
        match inner.commit() {
            Ok(()) => {
                debug!(key, total, "storage stream committed");
                Ok(())
            }
            Err(err) => {
                debug!(key, %err, "storage stream commit failed");
                Err(err)
            }
        }
    }
}
