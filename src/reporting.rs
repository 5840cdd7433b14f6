//! Paginated import-level / file-level / record-level read queries — §2
//! ReportingService.

use bson::{doc, Document};
use std::sync::Arc;

use crate::docstore::{Collection, DocumentStore, FindOptions};
use crate::errors::Error;
use crate::model::{FileProcessingReport, ImportReport};
use futures::TryStreamExt;

pub const IMPORT_REPORTS_COLLECTION: &str = "import_reports";

pub struct Page<T> {
    pub items: Vec<T>,
    pub skip: u64,
    pub top: u64,
    pub has_more: bool,
}

pub struct ReportingService {
    imports: Arc<dyn Collection>,
    files: Arc<dyn Collection>,
    lineage: Arc<dyn Collection>,
}

impl ReportingService {
    pub fn new(store: &dyn DocumentStore) -> Self {
        Self {
            imports: store.collection(IMPORT_REPORTS_COLLECTION),
            files: store.collection(crate::dedup::FILE_REPORTS_COLLECTION),
            lineage: store.collection(crate::lineage_recorder::COLLECTION),
        }
    }

    pub async fn get_import(&self, import_id: &str) -> Result<Option<ImportReport>, Error> {
        match self.imports.find_one(doc! { "_id": import_id }).await? {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn list_imports(&self, skip: u64, top: u64) -> Result<Page<ImportReport>, Error> {
        let total = self.imports.count(Document::new()).await?;
        let sort = doc! { "started_at": -1 };
        let stream = self.imports.find(Document::new(), FindOptions { skip: Some(skip), limit: Some(top as i64 + 1), sort: Some(sort) }).await?;
        let mut rows: Vec<Document> = stream.try_collect().await?;
        let has_more = rows.len() as u64 > top || skip + top < total;
        rows.truncate(top as usize);
        let items = rows.into_iter().map(bson::from_document).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, skip, top, has_more })
    }

    pub async fn list_files_for_import(&self, import_id: &str, skip: u64, top: u64) -> Result<Page<FileProcessingReport>, Error> {
        let filter = doc! { "import_id": import_id };
        let stream = self.files.find(filter.clone(), FindOptions { skip: Some(skip), limit: Some(top as i64), sort: Some(doc! { "file_key": 1 }) }).await?;
        let rows: Vec<Document> = stream.try_collect().await?;
        let items = rows.into_iter().map(bson::from_document).collect::<Result<Vec<_>, _>>()?;
        let total = self.files.count(filter).await?;
        let has_more = skip + (items.len() as u64) < total;
        Ok(Page { items, skip, top, has_more })
    }

    pub async fn lineage_for_record(&self, collection: &str, record_id: &str) -> Result<Option<Document>, Error> {
        let id = format!("{collection}:{record_id}");
        self.lineage.find_one(doc! { "_id": id }).await
    }
}
