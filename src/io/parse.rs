use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::error::IoError;
use crate::domain::{AttrValue, Attributes, FeedRecord};

/// Raw feed record as decoded from one line or row
#[derive(Debug, Deserialize)]
pub struct RawFeedRecord {
    #[serde(default, alias = "id")]
    pub guid: Option<Value>,
    #[serde(default, alias = "publishedAt", alias = "pubDate", alias = "date")]
    pub published_at: Option<Value>,
    #[serde(default, alias = "source_slug")]
    pub source: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawFeedRecord {
    /// Decode a JSON object
    pub fn from_json(value: Value) -> Result<Self, IoError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse this raw record into a validated FeedRecord
    pub fn parse(self) -> Result<FeedRecord, IoError> {
        let guid = match self.guid {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(IoError::MissingField("guid".to_string())),
        };

        let published_at = match self.published_at {
            Some(Value::String(s)) => parse_timestamp(&s)?,
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .ok_or_else(|| IoError::InvalidTimestamp(n.to_string()))?,
            _ => return Err(IoError::MissingField("published_at".to_string())),
        };

        let source = match self.source {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let attributes: Attributes = self
            .extra
            .iter()
            .map(|(name, value)| (name.clone(), AttrValue::from_json(value)))
            .collect();

        Ok(FeedRecord::new(guid, published_at, source, attributes)?)
    }
}

/// Parse the timestamp shapes seen in feeds (RFC 3339, RFC 2822, plain dates)
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IoError> {
    let trimmed = raw.trim();

    if let Ok(t) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        && let Some(t) = d.and_hms_opt(0, 0, 0)
    {
        return Ok(Utc.from_utc_datetime(&t));
    }

    Err(IoError::InvalidTimestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_record() {
        let raw = RawFeedRecord::from_json(json!({
            "guid": "job-1",
            "publishedAt": "2024-01-01T10:00:00Z",
            "source": "acme",
            "title": "Engineer",
            "salary": 100
        }))
        .unwrap();

        let record = raw.parse().unwrap();
        assert_eq!(record.guid(), "job-1");
        assert_eq!(record.source(), Some("acme"));
        assert_eq!(record.attributes().get("title"), Some(&AttrValue::from("Engineer")));
        assert_eq!(record.attributes().get("salary"), Some(&AttrValue::Int(100)));
        assert!(!record.attributes().contains_key("guid"));
    }

    #[test]
    fn missing_guid_is_rejected() {
        let raw = RawFeedRecord::from_json(json!({"published_at": "2024-01-01"})).unwrap();
        assert!(matches!(raw.parse(), Err(IoError::MissingField(f)) if f == "guid"));
    }

    #[test]
    fn missing_date_is_rejected() {
        let raw = RawFeedRecord::from_json(json!({"guid": "a"})).unwrap();
        assert!(matches!(raw.parse(), Err(IoError::MissingField(f)) if f == "published_at"));
    }

    #[test]
    fn numeric_guid_and_epoch_date() {
        let raw = RawFeedRecord::from_json(json!({"guid": 17, "date": 1704067200})).unwrap();
        let record = raw.parse().unwrap();
        assert_eq!(record.guid(), "17");
        assert_eq!(record.composite_key().unwrap().as_str(), "17|2024-01-01");
    }

    #[test]
    fn parses_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-02T01:00:00+01:00").unwrap(), expected);
        assert_eq!(parse_timestamp("Tue, 02 Jan 2024 00:00:00 +0000").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-02 00:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp(" 2024-01-02 ").unwrap(), expected);
        assert!(parse_timestamp("next tuesday").is_err());
    }
}
