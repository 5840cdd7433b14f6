//! Capability-typed façade over blob storage. Two instances are used in
//! practice: an *external source* (reader only) and an *internal target*
//! (reader + writer); a third *report sink* holds exported cleanse reports.

pub mod presign;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub container: String,
    pub key: String,
    pub size: u64,
    pub e_tag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub e_tag: String,
    pub last_modified: DateTime<Utc>,
    pub user_metadata: HashMap<String, String>,
}

pub struct ListPage {
    pub items: Vec<ObjectRef>,
    pub next_token: Option<String>,
}

/// A write handle returned by `open_write`. Dropping without calling
/// `finish` leaves the upload incomplete; callers must explicitly `finish`
/// or `abort` so the contract ("no partial object on error") is explicit
/// rather than relying on `Drop`.
pub struct WriteHandle {
    inner: Box<dyn object_store::MultipartUpload>,
    bytes_written: u64,
}

impl WriteHandle {
    pub async fn write_all(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.bytes_written += chunk.len() as u64;
        self.inner
            .put_part(object_store::PutPayload::from_bytes(chunk))
            .await
            .map_err(map_store_err)?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn finish(mut self) -> Result<(), Error> {
        self.inner.complete().await.map_err(map_store_err)?;
        Ok(())
    }

    pub async fn abort(mut self) -> Result<(), Error> {
        self.inner.abort().await.map_err(map_store_err)?;
        Ok(())
    }
}

/// Reader capability: every `ObjectStore` instance can read and enumerate.
/// Separate from the writer capability so an *external source* instance can
/// be constructed without ever offering mutating operations, mirroring the
/// source's factory-returns-a-read-only-interface design.
#[async_trait]
pub trait ObjectStoreReader: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>, Error>;

    async fn list_page(&self, prefix: &str, size: usize, token: Option<String>) -> Result<ListPage, Error>;

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata, Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    /// Streams the object body as raw chunks. The caller drives the stream to
    /// completion (or drops it early to cancel the read).
    async fn open_read(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error>;

    fn presign(&self, key: &str, ttl: Duration) -> Result<String, Error>;
}

/// Writer capability, only offered by read/write instances (the internal
/// target and the report sink).
#[async_trait]
pub trait ObjectStoreWriter: ObjectStoreReader {
    async fn open_write(&self, key: &str, content_type: Option<&str>, metadata: Option<HashMap<String, String>>) -> Result<WriteHandle, Error>;

    async fn upload(&self, key: &str, bytes: Bytes, content_type: Option<&str>, metadata: Option<HashMap<String, String>>) -> Result<(), Error>;

    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Deletes every object under this instance's configured prefix and
    /// returns the deleted keys. Never escapes the configured prefix.
    async fn clear_down(&self) -> Result<Vec<String>, Error>;
}

pub(crate) fn map_store_err(err: object_store::Error) -> Error {
    match &err {
        object_store::Error::NotFound { .. } => Error::NotFound(err.to_string()),
        object_store::Error::Precondition { .. } | object_store::Error::AlreadyExists { .. } => Error::Conflict(err.to_string()),
        object_store::Error::NotSupported { .. } | object_store::Error::InvalidPath { .. } | object_store::Error::Generic { .. } => {
            Error::TransientIo { message: err.to_string(), attempts: 1 }
        }
        _ => Error::TransientIo { message: err.to_string(), attempts: 1 },
    }
}
