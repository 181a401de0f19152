//! Response body stream that keeps its pooled client checked out
//!
//! The upstream body is streamed to the caller chunk by chunk. The lease on
//! the client that produced it is released once the stream ends cleanly; if
//! the stream fails, or the caller disconnects and the body is dropped early,
//! the lease is dropped with it and the pool discards that client.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use client_pool::Lease;
use futures_util::stream::Stream;
use pin_project_lite::pin_project;
use tracing::debug;

pin_project! {
    pub struct LeasedBody<S> {
        #[pin]
        inner: S,
        lease: Option<Lease>,
    }
}

impl<S> LeasedBody<S> {
    pub fn new(inner: S, lease: Lease) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }
}

impl<S, E> Stream for LeasedBody<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(e)) => {
                if let Some(lease) = this.lease.take() {
                    debug!(client_id = lease.client().id(), error = %e, "upstream body failed");
                }
                Poll::Ready(Some(Err(e)))
            }
            None => {
                if let Some(lease) = this.lease.take() {
                    lease.release();
                }
                Poll::Ready(None)
            }
        }
    }
}
