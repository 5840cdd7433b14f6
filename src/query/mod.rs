//! Parameterised reads with an optional per-operation memoised cache — §4.9.

pub mod cache;

use bson::{doc, Bson, Document};
use futures::TryStreamExt;

use crate::docstore::{Collection, FindOptions as StoreFindOptions};
use crate::errors::Error;

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Bson),
    Neq(String, Bson),
    Gt(String, Bson),
    Lt(String, Bson),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Contains(String, String),
    StartsWith(String, String),
    In(String, Vec<Bson>),
    Exists(String, bool),
    Empty,
}

impl Filter {
    /// Lowers the filter tree to a mongo-style query document.
    pub fn to_document(&self) -> Document {
        match self {
            Filter::Eq(field, value) => doc! { field: value.clone() },
            Filter::Neq(field, value) => doc! { field: { "$ne": value.clone() } },
            Filter::Gt(field, value) => doc! { field: { "$gt": value.clone() } },
            Filter::Lt(field, value) => doc! { field: { "$lt": value.clone() } },
            Filter::And(filters) => doc! { "$and": filters.iter().map(Filter::to_document).collect::<Vec<_>>() },
            Filter::Or(filters) => doc! { "$or": filters.iter().map(Filter::to_document).collect::<Vec<_>>() },
            Filter::Not(inner) => doc! { "$nor": [inner.to_document()] },
            Filter::Contains(field, needle) => doc! { field: { "$regex": regex::escape(needle), "$options": "i" } },
            Filter::StartsWith(field, prefix) => doc! { field: { "$regex": format!("^{}", regex::escape(prefix)), "$options": "i" } },
            Filter::In(field, values) => doc! { field: { "$in": values.clone() } },
            Filter::Exists(field, present) => doc! { field: { "$exists": *present } },
            Filter::Empty => Document::new(),
        }
    }

    /// Canonical textual form used as the cache key: field order and filter
    /// node order are made deterministic, numeric literals normalised to a
    /// fixed representation, so logically identical queries hash identically
    /// regardless of how the caller built the tree.
    fn canonical(&self) -> String {
        match self {
            Filter::Eq(f, v) => format!("eq({f},{})", canonical_bson(v)),
            Filter::Neq(f, v) => format!("neq({f},{})", canonical_bson(v)),
            Filter::Gt(f, v) => format!("gt({f},{})", canonical_bson(v)),
            Filter::Lt(f, v) => format!("lt({f},{})", canonical_bson(v)),
            Filter::And(inner) => {
                let mut parts: Vec<String> = inner.iter().map(Filter::canonical).collect();
                parts.sort();
                format!("and({})", parts.join(";"))
            }
            Filter::Or(inner) => {
                let mut parts: Vec<String> = inner.iter().map(Filter::canonical).collect();
                parts.sort();
                format!("or({})", parts.join(";"))
            }
            Filter::Not(inner) => format!("not({})", inner.canonical()),
            Filter::Contains(f, s) => format!("contains({f},{s})"),
            Filter::StartsWith(f, s) => format!("startswith({f},{s})"),
            Filter::In(f, values) => {
                let mut parts: Vec<String> = values.iter().map(canonical_bson).collect();
                parts.sort();
                format!("in({f},[{}])", parts.join(","))
            }
            Filter::Exists(f, present) => format!("exists({f},{present})"),
            Filter::Empty => "empty".to_string(),
        }
    }
}

fn canonical_bson(value: &Bson) -> String {
    match value {
        Bson::Double(d) => format!("f:{d:.12}"),
        Bson::Int32(i) => format!("f:{:.12}", *i as f64),
        Bson::Int64(i) => format!("f:{:.12}", *i as f64),
        Bson::String(s) => format!("s:{s}"),
        Bson::Boolean(b) => format!("b:{b}"),
        Bson::DateTime(d) => format!("d:{}", d.timestamp_millis()),
        Bson::Null => "null".to_string(),
        other => format!("x:{other:?}"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug)]
pub struct QueryParameters {
    pub collection_name: String,
    pub filter: Filter,
    pub order_by: Option<OrderBy>,
    pub skip: Option<u64>,
    pub top: Option<u64>,
}

impl QueryParameters {
    /// Deterministic cache key: collection name plus the filter's canonical
    /// form plus ordering/paging, independent of how the tree was built.
    pub fn cache_key(&self) -> String {
        let order = self.order_by.as_ref().map(|o| format!("{}:{}", o.field, o.descending)).unwrap_or_default();
        format!("{}|{}|{}|{:?}|{:?}", self.collection_name, self.filter.canonical(), order, self.skip, self.top)
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub data: Vec<Document>,
    pub total_count: Option<u64>,
    pub skip: u64,
    pub top: u64,
    pub has_more: bool,
}

/// Executes `QueryParameters` against the document store. Stateless; callers
/// wanting memoisation wrap this behind `cache::AnalysisContext`.
pub struct QueryService;

impl QueryService {
    pub async fn query(collection: &dyn Collection, params: &QueryParameters) -> Result<QueryResult, Error> {
        let filter = params.filter.to_document();
        let skip = params.skip.unwrap_or(0);
        let top = params.top.unwrap_or(500);

        let sort = params.order_by.as_ref().map(|o| doc! { &o.field: if o.descending { -1 } else { 1 } });
        let stream = collection.find(filter.clone(), StoreFindOptions { skip: Some(skip), limit: Some(top as i64 + 1), sort }).await?;
        let mut data: Vec<Document> = stream.try_collect().await?;
        let has_more = data.len() as u64 > top;
        data.truncate(top as usize);

        Ok(QueryResult { data, total_count: None, skip, top, has_more })
    }

    pub async fn query_single(collection: &dyn Collection, params: &QueryParameters) -> Result<Option<Document>, Error> {
        let mut one_row = params.clone();
        one_row.top = Some(1);
        Ok(QueryService::query(collection, &one_row).await?.data.into_iter().next())
    }
}

impl Clone for QueryParameters {
    fn clone(&self) -> Self {
        Self { collection_name: self.collection_name.clone(), filter: self.filter.clone(), order_by: self.order_by.clone(), skip: self.skip, top: self.top }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_is_stable_regardless_of_and_branch_order() {
        let a = Filter::And(vec![Filter::Eq("x".into(), Bson::Int32(1)), Filter::Eq("y".into(), Bson::Int32(2))]);
        let b = Filter::And(vec![Filter::Eq("y".into(), Bson::Int32(2)), Filter::Eq("x".into(), Bson::Int32(1))]);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn canonical_key_normalises_numeric_types() {
        let a = Filter::Eq("n".into(), Bson::Int32(5));
        let b = Filter::Eq("n".into(), Bson::Double(5.0));
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn different_filters_produce_different_cache_keys() {
        let params_a = QueryParameters { collection_name: "c".into(), filter: Filter::Eq("x".into(), Bson::Int32(1)), order_by: None, skip: None, top: None };
        let params_b = QueryParameters { collection_name: "c".into(), filter: Filter::Eq("x".into(), Bson::Int32(2)), order_by: None, skip: None, top: None };
        assert_ne!(params_a.cache_key(), params_b.cache_key());
    }
}
