pub mod csv_reader;
pub mod error;
pub mod jsonl_reader;
pub mod parse;
pub mod source;

// Re-export commonly used types
pub use csv_reader::CsvFeedSource;
pub use error::IoError;
pub use jsonl_reader::{JsonlFeedSource, MemoryFeedSource};
pub use parse::{RawFeedRecord, parse_timestamp};
pub use source::{FeedSource, FeedStream, PositionedStream};
