//! Stream batching utilities.

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Sleep, sleep};

/// Extension trait to add batching to any Stream.
pub trait BatchExt: Stream {
    /// Collect items into batches of at most `capacity`.
    ///
    /// A batch is emitted as soon as it is full, or `linger` after its
    /// first item arrived, whichever comes first. Partial batches flush
    /// on stream end; empty batches are never emitted.
    fn batched(self, capacity: usize, linger: Duration) -> Batched<Self>
    where
        Self: Sized,
    {
        Batched::new(self, capacity, linger)
    }
}

impl<T: Stream> BatchExt for T {}

pin_project! {
    /// A stream combinator that groups items into bounded batches.
    pub struct Batched<S: Stream> {
        #[pin]
        stream: S,
        capacity: usize,
        linger: Duration,
        buffer: Vec<S::Item>,
        // Armed when the buffer goes non-empty; boxed so resetting it is
        // a plain reassignment.
        deadline: Option<Pin<Box<Sleep>>>,
        done: bool,
    }
}

impl<S: Stream> Batched<S> {
    /// Create a new batching stream.
    pub fn new(stream: S, capacity: usize, linger: Duration) -> Self {
        assert!(capacity > 0, "batch capacity must be positive");
        Self { stream, capacity, linger, buffer: Vec::with_capacity(capacity), deadline: None, done: false }
    }
}

impl<S: Stream> Stream for Batched<S> {
    type Item = Vec<S::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        // Drain whatever the inner stream has ready.
        loop {
            if this.buffer.len() >= *this.capacity {
                *this.deadline = None;
                return Poll::Ready(Some(std::mem::take(this.buffer)));
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if this.buffer.is_empty() {
                        *this.deadline = Some(Box::pin(sleep(*this.linger)));
                    }
                    this.buffer.push(item);
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    *this.deadline = None;
                    return if this.buffer.is_empty() {
                        Poll::Ready(None)
                    } else {
                        Poll::Ready(Some(std::mem::take(this.buffer)))
                    };
                }
                Poll::Pending => break,
            }
        }

        // Nothing more right now; flush on the linger deadline.
        if let Some(deadline) = this.deadline.as_mut() {
            ready!(deadline.as_mut().poll(cx));
            *this.deadline = None;
            if !this.buffer.is_empty() {
                return Poll::Ready(Some(std::mem::take(this.buffer)));
            }
        }

        Poll::Pending
    }
}
