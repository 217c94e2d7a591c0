// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project::pin_project;
use tokio::time::{sleep_until, Instant, Sleep};

/// Paces a byte stream so its average throughput stays at or below `bytes_per_second`.
///
/// Chunks are never split; the stream pauses before the chunk after one that put it ahead of
/// schedule. A rate of 0 passes everything through untouched.
pub fn throttled<S>(inner: S, bytes_per_second: u64) -> Throttled<S> {
    Throttled {
        inner,
        bytes_per_second,
        started: None,
        sent: 0,
        delay: None,
    }
}

#[pin_project]
#[must_use = "streams do nothing unless polled"]
pub struct Throttled<S> {
    #[pin]
    inner: S,
    bytes_per_second: u64,
    started: Option<Instant>,
    sent: u64,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<S, E> Stream for Throttled<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            *this.delay = None;
        }

        let item = ready!(this.inner.poll_next(cx));
        let rate = *this.bytes_per_second;
        match &item {
            Some(Ok(chunk)) if rate > 0 => {
                let started = *this.started.get_or_insert_with(Instant::now);
                *this.sent += chunk.len() as u64;
                let due = started + Duration::from_secs_f64(*this.sent as f64 / rate as f64);
                if due > Instant::now() {
                    *this.delay = Some(Box::pin(sleep_until(due)));
                }
            }
            _ => {}
        }
        Poll::Ready(item)
    }
}
