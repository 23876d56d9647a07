// Filesystem blob store: one file per key under a root folder, replaced atomically on save.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{BlobStore, BlobWriter};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FsOptions {
    pub folder: PathBuf,
}

impl FsOptions {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FsStore {
    folder: PathBuf,
}

impl FsStore {
    pub fn open(options: FsOptions) -> Result<Self, Error> {
        let folder = options.folder;
        fs::create_dir_all(&folder).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create storage folder")
                .with_path(&folder)
                .with_source(err)
        })?;
        Ok(Self { folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, Error> {
        if key.is_empty()
            || key == "."
            || key == ".."
            || key.contains('/')
            || key.contains('\\')
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("blob key must be a plain file name")
                .with_key(key));
        }
        Ok(self.folder.join(key))
    }
}

impl BlobStore for FsStore {
    fn read(&self, key: &str) -> Result<Bytes, Error> {
        let mut reader = self.read_streaming(key)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read blob")
                .with_key(key)
                .with_source(err)
        })?;
        Ok(Bytes::from(buf))
    }

    fn read_streaming(&self, key: &str) -> Result<Box<dyn Read + Send>, Error> {
        let path = self.key_path(key)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::not_found(key)),
            Err(err) => Err(Error::new(ErrorKind::Io)
                .with_message("failed to open blob")
                .with_path(&path)
                .with_source(err)),
        }
    }

    fn save_streaming(&self, key: &str) -> Result<Box<dyn BlobWriter>, Error> {
        let path = self.key_path(key)?;
        let tmp_path = self
            .folder
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to create blob")
                    .with_path(&tmp_path)
                    .with_source(err)
            })?;
        Ok(Box::new(FsWriter {
            file: Some(BufWriter::new(file)),
            tmp_path,
            path,
        }))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let path = self.key_path(key)?;
        fs::remove_file(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => Error::not_found(key),
            _ => Error::new(ErrorKind::Io)
                .with_message("failed to delete blob")
                .with_path(&path)
                .with_source(err),
        })
    }
}

struct FsWriter {
    file: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    path: PathBuf,
}

impl Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("blob writer already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BlobWriter for FsWriter {
    fn commit(mut self: Box<Self>) -> Result<(), Error> {
        let Some(file) = self.file.take() else {
            return Err(Error::new(ErrorKind::Internal).with_message("blob writer already committed"));
        };
        let file = file.into_inner().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to flush blob")
                .with_path(&self.tmp_path)
                .with_source(err.into_error())
        })?;
        file.sync_all().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to sync blob")
                .with_path(&self.tmp_path)
                .with_source(err)
        })?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path).map_err(|err| {
            let _ = fs::remove_file(&self.tmp_path);
            Error::new(ErrorKind::Io)
                .with_message("failed to replace blob")
                .with_path(&self.path)
                .with_source(err)
        })
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}
