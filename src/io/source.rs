use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use pin_project_lite::pin_project;

use super::error::IoError;
use crate::domain::FeedRecord;

/// Type alias for a boxed feed record stream
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedRecord, IoError>> + Send>>;

/// Sequential, restartable access to a line-delimited feed
///
/// Every line or row occupies one position, including malformed ones, so a
/// resume index always points at the same physical record.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Cheap pass counting every record position
    async fn count_total(&self) -> Result<u64, IoError>;

    /// Open a stream positioned at record `skip` (zero based)
    async fn open_from(&self, skip: u64) -> Result<FeedStream, IoError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

pin_project! {
    /// Stream adapter tagging each item with its absolute record position
    pub struct PositionedStream<S> {
        #[pin]
        inner: S,
        next_position: u64,
    }
}

impl<S> PositionedStream<S> {
    /// Wrap a stream whose first item sits at `start`
    pub fn new(inner: S, start: u64) -> Self {
        Self {
            inner,
            next_position: start,
        }
    }

    /// Position the next yielded item will carry
    pub fn next_position(&self) -> u64 {
        self.next_position
    }
}

impl<S: Stream> Stream for PositionedStream<S> {
    type Item = (u64, S::Item);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                let position = *this.next_position;
                *this.next_position += 1;
                Poll::Ready(Some((position, item)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
