//! Concrete `ObjectStore` built on the `object_store` crate. The same struct
//! backs production S3 buckets (`object_store::aws::AmazonS3`) and in-memory
//! test doubles (`object_store::memory::InMemory`) — tests exercise the real
//! trait instead of a hand-rolled fake.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use object_store::path::Path as StorePath;
use object_store::{ObjectStore as DynObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{map_store_err, ListPage, ObjectMetadata, ObjectRef, ObjectStoreReader, ObjectStoreWriter, WriteHandle};
use crate::errors::Error;
use crate::objectstore::presign::{presign_get_url, S3Credentials};

/// One logical bucket scoped to a prefix (the `ClearDown` boundary). Built
/// either over a real S3 bucket or an in-memory store.
pub struct S3ObjectStore {
    store: Arc<dyn DynObjectStore>,
    container: String,
    prefix: String,
    endpoint: String,
    credentials: Option<S3Credentials>,
}

impl S3ObjectStore {
    pub fn new(store: Arc<dyn DynObjectStore>, container: impl Into<String>, prefix: impl Into<String>, endpoint: impl Into<String>, credentials: Option<S3Credentials>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { store, container: container.into(), prefix, endpoint: endpoint.into(), credentials }
    }

    pub fn in_memory(container: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), container, prefix, "s3.amazonaws.com", None)
    }

    fn scoped_path(&self, key: &str) -> StorePath {
        if self.prefix.is_empty() {
            StorePath::from(key)
        } else {
            StorePath::from(format!("{}/{key}", self.prefix))
        }
    }

    fn strip_prefix(&self, path: &StorePath) -> String {
        let full = path.to_string();
        if self.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(&format!("{}/", self.prefix)).unwrap_or(&full).to_string()
        }
    }
}

#[async_trait]
impl ObjectStoreReader for S3ObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>, Error> {
        let scoped = self.scoped_path(prefix);
        let mut stream = self.store.list(Some(&scoped));
        let mut out = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(map_store_err)?;
            out.push(ObjectRef {
                container: self.container.clone(),
                key: self.strip_prefix(&meta.location),
                size: meta.size as u64,
                e_tag: meta.e_tag.unwrap_or_default(),
                last_modified: meta.last_modified,
            });
        }
        Ok(out)
    }

    async fn list_page(&self, prefix: &str, size: usize, token: Option<String>) -> Result<ListPage, Error> {
        // object_store has no native continuation token; emulate one as a
        // "resume after this key" cursor over the full, lexicographically
        // sorted listing. Adequate for the modest per-run dataset volumes
        // this pipeline deals with (§1 Non-goals: no web-scale listings).
        let mut all = self.list(prefix).await?;
        all.sort_by(|a, b| a.key.cmp(&b.key));
        let start = match token {
            Some(after) => all.iter().position(|o| o.key > after).unwrap_or(all.len()),
            None => 0,
        };
        let end = (start + size).min(all.len());
        let items = all[start..end].to_vec();
        let next_token = if end < all.len() { items.last().map(|o| o.key.clone()) } else { None };
        Ok(ListPage { items, next_token })
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata, Error> {
        let meta = self.store.head(&self.scoped_path(key)).await.map_err(map_store_err)?;
        Ok(ObjectMetadata {
            size: meta.size as u64,
            content_type: None,
            e_tag: meta.e_tag.unwrap_or_default(),
            last_modified: meta.last_modified,
            user_metadata: HashMap::new(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        match self.store.head(&self.scoped_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(other) => Err(map_store_err(other)),
        }
    }

    async fn open_read(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        let result = self.store.get(&self.scoped_path(key)).await.map_err(map_store_err)?;
        let stream = result.into_stream().map(|chunk| chunk.map_err(map_store_err));
        Ok(stream.boxed())
    }

    fn presign(&self, key: &str, ttl: Duration) -> Result<String, Error> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::InputInvalid("presigning requires S3 credentials, not available for the in-memory store".to_string()))?;
        let full_key = if self.prefix.is_empty() { key.to_string() } else { format!("{}/{key}", self.prefix) };
        presign_get_url(creds, &self.endpoint, &self.container, &full_key, ttl, chrono::Utc::now())
    }
}

#[async_trait]
impl ObjectStoreWriter for S3ObjectStore {
    async fn open_write(&self, key: &str, content_type: Option<&str>, metadata: Option<HashMap<String, String>>) -> Result<WriteHandle, Error> {
        let mut opts = object_store::PutMultipartOpts::default();
        if let Some(ct) = content_type {
            opts.attributes.insert(object_store::Attribute::ContentType, ct.to_string().into());
        }
        for (k, v) in metadata.unwrap_or_default() {
            opts.attributes.insert(object_store::Attribute::Metadata(k.into()), v.into());
        }
        let upload = self.store.put_multipart_opts(&self.scoped_path(key), opts).await.map_err(map_store_err)?;
        Ok(WriteHandle::from_inner(upload))
    }

    async fn upload(&self, key: &str, bytes: Bytes, content_type: Option<&str>, metadata: Option<HashMap<String, String>>) -> Result<(), Error> {
        let mut opts = object_store::PutOptions::default();
        if let Some(ct) = content_type {
            opts.attributes.insert(object_store::Attribute::ContentType, ct.to_string().into());
        }
        for (k, v) in metadata.unwrap_or_default() {
            opts.attributes.insert(object_store::Attribute::Metadata(k.into()), v.into());
        }
        self.store.put_opts(&self.scoped_path(key), PutPayload::from_bytes(bytes), opts).await.map_err(map_store_err)?;
        Ok(())
    }

    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<(), Error> {
        // object_store has no in-place metadata patch; re-read and re-put.
        let existing = self.store.get(&self.scoped_path(key)).await.map_err(map_store_err)?;
        let bytes = existing.bytes().await.map_err(map_store_err)?;
        self.upload(key, bytes, None, Some(metadata)).await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.store.delete(&self.scoped_path(key)).await.map_err(map_store_err)
    }

    async fn clear_down(&self) -> Result<Vec<String>, Error> {
        let items = self.list("").await?;
        let mut deleted = Vec::with_capacity(items.len());
        for item in items {
            self.delete(&item.key).await?;
            deleted.push(item.key);
        }
        Ok(deleted)
    }
}

impl WriteHandle {
    pub(crate) fn from_inner(inner: Box<dyn object_store::MultipartUpload>) -> Self {
        Self { inner, bytes_written: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3ObjectStore {
        S3ObjectStore::in_memory("litp-test", "scope")
    }

    #[tokio::test]
    async fn upload_then_read_round_trips_bytes() {
        let store = store();
        store.upload("a/b.csv", Bytes::from_static(b"hello"), Some("text/csv"), None).await.unwrap();
        assert!(store.exists("a/b.csv").await.unwrap());
        let mut stream = store.open_read("a/b.csv").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");
    }

    #[tokio::test]
    async fn clear_down_only_touches_the_scoped_prefix() {
        let store = store();
        store.upload("x.csv", Bytes::from_static(b"1"), None, None).await.unwrap();
        store.upload("y.csv", Bytes::from_static(b"2"), None, None).await.unwrap();
        let deleted = store.clear_down().await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(!store.exists("x.csv").await.unwrap());
    }

    #[tokio::test]
    async fn list_page_paginates_in_lexicographic_order() {
        let store = store();
        for n in 0..5 {
            store.upload(&format!("f{n}.csv"), Bytes::from_static(b"x"), None, None).await.unwrap();
        }
        let first = store.list_page("", 2, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.next_token.is_some());
        let second = store.list_page("", 10, first.next_token).await.unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.next_token.is_none());
    }

    #[test]
    fn presign_fails_without_credentials_on_the_in_memory_store() {
        let store = store();
        assert!(store.presign("a.csv", Duration::from_secs(60)).is_err());
    }
}
