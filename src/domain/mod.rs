pub mod clock;
pub mod entity;
pub mod error;
pub mod failure;
pub mod key;
pub mod record;
pub mod value;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{EntityId, TargetEntity};
pub use error::DomainError;
pub use failure::{Classify, Failure, FailureType, Severity, classify_message};
pub use key::CompositeKey;
pub use record::FeedRecord;
pub use value::{AttrValue, Attributes};
