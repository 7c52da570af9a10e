use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv_async::AsyncReaderBuilder;
use futures::StreamExt;
use tokio::fs::File;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::error::IoError;
use super::parse::RawFeedRecord;
use super::source::{FeedSource, FeedStream};

/// CSV feed file with a header row
///
/// `guid`, `published_at` (or `publishedAt`/`pubDate`/`date`) and `source`
/// columns are recognized; every other column becomes a text attribute.
pub struct CsvFeedSource {
    path: PathBuf,
}

impl CsvFeedSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn builder() -> AsyncReaderBuilder {
        let mut builder = AsyncReaderBuilder::new();
        builder.trim(csv_async::Trim::All).flexible(true);
        builder
    }
}

fn row_to_raw(row: BTreeMap<String, String>) -> Result<RawFeedRecord, IoError> {
    let object: serde_json::Map<String, serde_json::Value> = row
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    RawFeedRecord::from_json(serde_json::Value::Object(object))
}

#[async_trait]
impl FeedSource for CsvFeedSource {
    async fn count_total(&self) -> Result<u64, IoError> {
        let file = File::open(&self.path).await?;
        let mut reader = Self::builder().create_reader(file.compat());
        // Rows that fail to decode still occupy a position
        let total = reader.records().count().await;
        Ok(total as u64)
    }

    async fn open_from(&self, skip: u64) -> Result<FeedStream, IoError> {
        let file = File::open(&self.path).await?;
        let reader = Self::builder().create_deserializer(file.compat());

        let records = reader
            .into_deserialize::<BTreeMap<String, String>>()
            .skip(skip as usize)
            .map(|result| {
                result
                    .map_err(IoError::from)
                    .and_then(row_to_raw)
                    .and_then(RawFeedRecord::parse)
            });

        Ok(Box::pin(records))
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttrValue;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const FEED: &str = "\
guid,published_at,source,title
A,2024-01-01,acme,Engineer
,2024-01-02,acme,No guid
  B  ,  2024-01-03  ,,Designer
";

    #[tokio::test]
    async fn counts_rows() {
        let file = csv_file(FEED);
        let source = CsvFeedSource::new(file.path());
        assert_eq!(source.count_total().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reads_rows_with_trimming() {
        let file = csv_file(FEED);
        let source = CsvFeedSource::new(file.path());
        let items: Vec<_> = source.open_from(0).await.unwrap().collect().await;

        assert_eq!(items.len(), 3);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.guid(), "A");
        assert_eq!(first.source(), Some("acme"));
        assert_eq!(first.attributes().get("title"), Some(&AttrValue::from("Engineer")));

        assert!(matches!(items[1], Err(IoError::MissingField(_))));

        let third = items[2].as_ref().unwrap();
        assert_eq!(third.guid(), "B");
        assert_eq!(third.source(), None);
    }

    #[tokio::test]
    async fn open_from_skips_rows() {
        let file = csv_file(FEED);
        let source = CsvFeedSource::new(file.path());
        let items: Vec<_> = source.open_from(2).await.unwrap().collect().await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().guid(), "B");
    }

    #[tokio::test]
    async fn undecodable_row_is_a_record_level_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"guid,published_at\nA,2024-01-01\nB\xff,2024-01-02\nC,2024-01-03\n").unwrap();
        let source = CsvFeedSource::new(file.path());

        assert_eq!(source.count_total().await.unwrap(), 3);
        let items: Vec<_> = source.open_from(0).await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().guid(), "A");
        assert!(items[1].as_ref().unwrap_err().is_record_level());
        assert_eq!(items[2].as_ref().unwrap().guid(), "C");
    }

    #[tokio::test]
    async fn header_only_file_is_empty() {
        let file = csv_file("guid,published_at\n");
        let source = CsvFeedSource::new(file.path());
        assert_eq!(source.count_total().await.unwrap(), 0);
        let items: Vec<_> = source.open_from(0).await.unwrap().collect().await;
        assert!(items.is_empty());
    }
}
