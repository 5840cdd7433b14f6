//! Resolves, for a date range and a set of dataset definitions, the matching
//! object keys under a target prefix — §4.3.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;

use crate::errors::Error;
use crate::model::DatasetDefinition;
use crate::objectstore::{ObjectRef, ObjectStoreReader};

#[derive(Debug, Clone, Copy)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn today(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self { from: today, to: today }
    }

    pub fn last_n_days(now: DateTime<Utc>, n: i64) -> Self {
        let today = now.date_naive();
        Self { from: today - chrono::Duration::days(n - 1), to: today }
    }

    fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

pub struct FileCatalogue<'a> {
    store: &'a dyn ObjectStoreReader,
}

impl<'a> FileCatalogue<'a> {
    pub fn new(store: &'a dyn ObjectStoreReader) -> Self {
        Self { store }
    }

    /// For each definition, the `ObjectRef`s whose filename matches and whose
    /// parsed timestamp falls in `range`, ordered by `last_modified` desc
    /// (ties broken by key asc).
    pub async fn resolve(&self, definitions: &[DatasetDefinition], range: DateRange) -> Result<HashMap<String, Vec<ObjectRef>>, Error> {
        let mut out = HashMap::new();
        for def in definitions {
            let mut matches = Vec::new();
            let pattern = def.filename_pattern()?;
            for object in self.store.list("").await? {
                let file_name = object.key.rsplit('/').next().unwrap_or(&object.key);
                let stem = file_name.strip_suffix(".csv.enc").or_else(|| file_name.strip_suffix(".csv")).unwrap_or(file_name);
                let Some(caps) = pattern.captures(stem) else { continue };
                let Ok(ts) = def.parse_timestamp(&caps["ts"]) else { continue };
                let ts_utc = Utc.from_utc_datetime(&ts);
                if range.contains(ts_utc.date_naive()) {
                    matches.push(object);
                }
            }
            matches.sort_by(|a, b| b.last_modified.cmp(&a.last_modified).then_with(|| a.key.cmp(&b.key)));
            out.insert(def.name.clone(), matches);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::s3::S3ObjectStore;
    use bytes::Bytes;

    #[test]
    fn last_n_days_spans_n_calendar_days_ending_today() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
        let range = DateRange::last_n_days(now, 3);
        assert_eq!(range.from, NaiveDate::from_ymd_opt(2026, 1, 13).unwrap());
        assert_eq!(range.to, NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
    }

    #[tokio::test]
    async fn resolves_matching_files_ordered_newest_first() {
        use crate::objectstore::ObjectStoreWriter;
        let store = S3ObjectStore::in_memory("litp", "");
        store.upload("LITP_KEEPERS_20260110000000.csv", Bytes::from_static(b"a"), None, None).await.unwrap();
        store.upload("LITP_KEEPERS_20260112000000.csv", Bytes::from_static(b"b"), None, None).await.unwrap();
        store.upload("LITP_OTHER_20260112000000.csv", Bytes::from_static(b"c"), None, None).await.unwrap();

        let def = DatasetDefinition::new("KEEPERS", "LITP_KEEPERS_{0}", vec!["ID".into()]);
        let catalogue = FileCatalogue::new(&store);
        let range = DateRange { from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), to: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap() };
        let resolved = catalogue.resolve(std::slice::from_ref(&def), range).await.unwrap();
        let keepers = &resolved["KEEPERS"];
        assert_eq!(keepers.len(), 2);
        assert!(keepers[0].key.contains("20260112"));
    }
}
