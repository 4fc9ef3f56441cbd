//! Response body instrumentation.
//!
//! A streamed response's size and total time are only known when its last
//! byte goes out, so the access-log record rides along inside the body and
//! is finalized when the stream completes (or the client walks away and the
//! body is dropped mid-flight).
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};

use crate::access_log::{AccessLogRecord, AccessLogger};

/// A pending access-log record waiting for the response to finish.
pub struct PendingRecord {
    pub record: AccessLogRecord,
    pub started: Instant,
    pub logger: AccessLogger,
}

impl PendingRecord {
    /// Complete the record and hand it to the log pipeline.
    pub fn finish(mut self, response_bytes: u64) {
        self.record.response_bytes = response_bytes;
        self.record.response_time = Some(self.started.elapsed().as_secs_f64());
        self.logger.log(self.record);
    }
}

/// Counts the bytes of the wrapped body and finalizes the pending record at
/// end-of-stream or on drop.
pub struct CountingBody<B> {
    inner: B,
    counted: u64,
    pending: Option<PendingRecord>,
}

impl<B> CountingBody<B> {
    pub fn new(inner: B, pending: PendingRecord) -> Self {
        Self {
            inner,
            counted: 0,
            pending: Some(pending),
        }
    }

    fn finalize(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.finish(self.counted);
        }
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counted += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.finalize();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finalize();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CountingBody<B> {
    fn drop(&mut self) {
        // Client disconnected mid-stream: log what was sent.
        if let Some(pending) = self.pending.take() {
            pending.finish(self.counted);
        }
    }
}
