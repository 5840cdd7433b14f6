//! Pages through active issues, writes a zipped CSV to the report sink, and
//! returns a presigned download URL — §4.12 step c.

use std::io::Write;
use std::time::Duration;

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::errors::Error;
use crate::issues::IssueRepository;
use crate::model::cleanse::Issue;
use crate::objectstore::{ObjectStoreReader, ObjectStoreWriter};

pub struct ExportedReport {
    pub object_key: String,
    pub presigned_url: String,
    pub issue_count: u64,
}

pub struct Exporter<'a> {
    issues: &'a IssueRepository,
    sink: &'a dyn ObjectStoreWriter,
}

const PAGE_SIZE: u64 = 500;
const CSV_ENTRY_NAME: &str = "issues.csv";

impl<'a> Exporter<'a> {
    pub fn new(issues: &'a IssueRepository, sink: &'a dyn ObjectStoreWriter) -> Self {
        Self { issues, sink }
    }

    pub async fn export(&self, operation_id: &str, presign_ttl: Duration) -> Result<ExportedReport, Error> {
        let mut zip_bytes = Vec::new();
        let mut issue_count = 0u64;

        {
            let mut writer = ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer.start_file(CSV_ENTRY_NAME, SimpleFileOptions::default()).map_err(Error::Zip)?;
            let mut csv_writer = csv::WriterBuilder::new().from_writer(&mut writer);
            csv_writer.write_record(["id", "code", "cts_lid_full_identifier", "cph", "created_at", "is_active", "resolution_status"]).map_err(Error::Csv)?;

            // Preserves the original behaviour of always producing a zip with
            // an (empty) CSV header row even when there are zero active issues.
            let mut skip = 0u64;
            loop {
                let page = self.issues.list_active(skip, PAGE_SIZE).await?;
                if page.is_empty() {
                    break;
                }
                for issue in &page {
                    write_row(&mut csv_writer, issue)?;
                    issue_count += 1;
                }
                skip += page.len() as u64;
                if (page.len() as u64) < PAGE_SIZE {
                    break;
                }
            }
            csv_writer.flush().map_err(Error::Io)?;
            drop(csv_writer);
            writer.finish().map_err(Error::Zip)?;
        }

        let object_key = format!("{operation_id}.zip");
        self.sink.upload(&object_key, bytes::Bytes::from(zip_bytes), Some("application/zip"), None).await?;
        let presigned_url = self.sink.presign(&object_key, presign_ttl)?;

        Ok(ExportedReport { object_key, presigned_url, issue_count })
    }
}

fn write_row<W: Write>(writer: &mut csv::Writer<W>, issue: &Issue) -> Result<(), Error> {
    writer
        .write_record([
            issue.id.as_str(),
            issue.code.as_str(),
            issue.cts_lid_full_identifier.as_str(),
            issue.cph.as_str(),
            &issue.created_at.to_rfc3339(),
            &issue.is_active.to_string(),
            &format!("{:?}", issue.resolution_status),
        ])
        .map_err(Error::Csv)
}
