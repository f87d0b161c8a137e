//! HTTP framing for answer streams.
//!
//! [`paced_chunks`] replays a complete answer as fixed-size slices with an
//! inter-chunk delay. [`sse_response`] frames any [`TextStream`] as
//! `text/event-stream`; [`plain_text_response`] sends the raw increments as a
//! chunked `text/plain` body. A client disconnect drops the body stream,
//! which stops the producer at its next suspension point.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use futures::StreamExt;

use context_relay_core::stream::{slice_text, EventStream, TextStream};

/// Slice `text` into `chunk_size`-character pieces, sleeping `delay`
/// between consecutive pieces.
pub fn paced_chunks(text: &str, chunk_size: usize, delay: Duration) -> TextStream {
    let chunks = slice_text(text, chunk_size);
    Box::pin(
        futures::stream::iter(chunks.into_iter().enumerate()).then(move |(i, chunk)| async move {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, anyhow::Error>(chunk)
        }),
    )
}

/// `data: <JSON>\n\n` events, ending with exactly one `done` or `error` event.
pub fn sse_response(stream: TextStream) -> Response {
    let frames = EventStream::new(stream).map(|event| Ok::<_, Infallible>(event.sse_frame()));
    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Raw increments as a chunked body. A producer failure aborts the body.
pub fn plain_text_response(stream: TextStream) -> Response {
    let body = stream.map(|chunk| {
        chunk.map_err(|e| {
            tracing::warn!(error = %e, "text stream failed, closing response");
            std::io::Error::other(format!("{e:#}"))
        })
    });
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
