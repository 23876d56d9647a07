//! Purpose: Byte-keyed blob storage used as the durable layer under the JSON kv backend.
//! Exports: `BlobStore`, `BlobWriter`, `MemoryStore`, `FsStore`, `FsOptions`, `LoggedStore`.
//! Role: Leaf capability; no locking beyond the backing map/file operations.
//! Invariants: An absent key is always reported as `ErrorKind::NotFound`, never as `Io`.
//! Invariants: Streaming writes become visible only when committed.
#![allow(clippy::result_large_err)]

mod fs;
mod logged;
mod memory;

use std::io::{Read, Write};

use bytes::Bytes;

use crate::core::error::{Error, ErrorKind};

pub use fs::{FsOptions, FsStore};
pub use logged::LoggedStore;
pub use memory::MemoryStore;

/// A pending streaming write. Dropping it without `commit` discards the content.
pub trait BlobWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<(), Error>;
}

pub trait BlobStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Bytes, Error>;

    fn read_streaming(&self, key: &str) -> Result<Box<dyn Read + Send>, Error>;

    fn save(&self, key: &str, content: &[u8]) -> Result<(), Error> {
        let mut writer = self.save_streaming(key)?;
        writer.write_all(content).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write blob")
                .with_key(key)
                .with_source(err)
        })?;
        writer.commit()
    }

    fn save_streaming(&self, key: &str) -> Result<Box<dyn BlobWriter>, Error>;

    fn delete(&self, key: &str) -> Result<(), Error>;
}
