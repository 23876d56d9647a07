// In-process blob store; never persisted.
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::{BlobStore, BlobWriter};
use crate::core::error::Error;

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        self.data.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl BlobStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Bytes, Error> {
        self.data()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    fn read_streaming(&self, key: &str) -> Result<Box<dyn Read + Send>, Error> {
        let content = self.read(key)?;
        Ok(Box::new(io::Cursor::new(content)))
    }

    fn save(&self, key: &str, content: &[u8]) -> Result<(), Error> {
        self.data()
            .insert(key.to_string(), Bytes::copy_from_slice(content));
        Ok(())
    }

    fn save_streaming(&self, key: &str) -> Result<Box<dyn BlobWriter>, Error> {
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: Vec::new(),
            store: self.clone(),
        }))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        match self.data().remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(key)),
        }
    }
}

struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    store: MemoryStore,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryWriter {
    fn commit(self: Box<Self>) -> Result<(), Error> {
        let MemoryWriter { key, buf, store } = *self;
        store.data().insert(key, Bytes::from(buf));
        Ok(())
    }
}
