use async_trait::async_trait;
use bson::Document;
use futures::stream::{BoxStream, TryStreamExt};
use mongodb::options::{FindOptions as MongoFindOptions, IndexOptions, ReplaceOptions};
use mongodb::{Client, Database, IndexModel};
use std::sync::Arc;

use super::{BulkWriteOutcome, Collection as CollectionTrait, DocumentStore, FindOptions, IndexOrder, IndexSpec, UpsertOne};
use crate::errors::Error;

pub struct MongoDocumentStore {
    database: Database,
}

impl MongoDocumentStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self { database: client.database(database) })
    }

    pub fn from_client(client: Client, database: &str) -> Self {
        Self { database: client.database(database) }
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    fn collection(&self, name: &str) -> Arc<dyn CollectionTrait> {
        Arc::new(MongoCollection { inner: self.database.collection::<Document>(name), name: name.to_string() })
    }

    async fn clear_down(&self, collections: &[&str]) -> Result<(), Error> {
        for name in collections {
            self.database.collection::<Document>(name).delete_many(Document::new()).await?;
        }
        Ok(())
    }
}

struct MongoCollection {
    inner: mongodb::Collection<Document>,
    name: String,
}

fn order_to_i32(order: IndexOrder) -> i32 {
    match order {
        IndexOrder::Asc => 1,
        IndexOrder::Desc => -1,
    }
}

#[async_trait]
impl CollectionTrait for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, Error> {
        Ok(self.inner.find_one(filter).await?)
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<BoxStream<'static, Result<Document, Error>>, Error> {
        let mut mongo_opts = MongoFindOptions::default();
        mongo_opts.skip = options.skip;
        mongo_opts.limit = options.limit;
        mongo_opts.sort = options.sort;

        let cursor = self.inner.find(filter).with_options(mongo_opts).await?;
        let stream = cursor.map_err(Error::from);
        Ok(Box::pin(stream))
    }

    async fn count(&self, filter: Document) -> Result<u64, Error> {
        Ok(self.inner.count_documents(filter).await?)
    }

    async fn insert_one(&self, document: Document) -> Result<(), Error> {
        self.inner.insert_one(document).await?;
        Ok(())
    }

    async fn replace_one(&self, filter: Document, replacement: Document) -> Result<(), Error> {
        self.inner.replace_one(filter, replacement).with_options(ReplaceOptions::builder().upsert(true).build()).await?;
        Ok(())
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<(), Error> {
        self.inner.update_one(filter, update).await?;
        Ok(())
    }

    async fn delete_one(&self, filter: Document) -> Result<(), Error> {
        self.inner.delete_one(filter).await?;
        Ok(())
    }

    async fn bulk_upsert(&self, items: Vec<UpsertOne>) -> Result<BulkWriteOutcome, Error> {
        // mongodb's native bulk_write targets a `Client`, not a single typed
        // collection handle, and mixing untyped `Document` namespaces through
        // it adds little over a sequential upsert loop at the batch sizes
        // this pipeline deals with (hundreds to low thousands of rows).
        let mut outcome = BulkWriteOutcome::default();
        for item in items {
            let result = self
                .inner
                .replace_one(item.filter, item.replacement)
                .with_options(ReplaceOptions::builder().upsert(true).build())
                .await?;
            if result.upserted_id.is_some() {
                outcome.inserted += 1;
            } else {
                outcome.modified += result.modified_count;
            }
        }
        Ok(outcome)
    }

    async fn ensure_indexes(&self, specs: Vec<IndexSpec>) -> Result<(), Error> {
        for spec in specs {
            let mut keys = Document::new();
            for (field, order) in &spec.keys {
                keys.insert(field, order_to_i32(*order));
            }
            let model = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().name(spec.name.clone()).unique(spec.unique).build())
                .build();
            self.inner.create_index(model).await?;
        }
        Ok(())
    }
}
