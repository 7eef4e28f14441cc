//! Frame pumps: bridge an upstream token stream into the client's framing
//! (NDJSON lines or SSE data blocks) through a bounded channel. The response
//! body is fed straight from the channel, so every frame flushes as it is
//! produced, and a dropped receiver (client disconnect) stops the pump and
//! releases the upstream handle.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub(crate) const FRAME_CHANNEL_CAPACITY: usize = 32;

pub(crate) fn ndjson_response(rx: mpsc::Receiver<Bytes>) -> Response {
    framed_response("application/x-ndjson", rx)
}

pub(crate) fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    framed_response("text/event-stream", rx)
}

fn framed_response(content_type: &'static str, rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// One NDJSON frame. Err means the client is gone.
pub(crate) async fn send_json_line<T: Serialize>(
    tx: &mpsc::Sender<Bytes>,
    frame: &T,
) -> Result<(), ()> {
    let mut line = match serde_json::to_vec(frame) {
        Ok(line) => line,
        Err(_) => return Err(()),
    };
    line.push(b'\n');
    tx.send(Bytes::from(line)).await.map_err(|_| ())
}

/// One SSE `data:` frame. Err means the client is gone.
pub(crate) async fn send_sse_json<T: Serialize>(
    tx: &mpsc::Sender<Bytes>,
    frame: &T,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(_) => return Err(()),
    };
    tx.send(Bytes::from(format!("data: {payload}\n\n")))
        .await
        .map_err(|_| ())
}

pub(crate) async fn send_sse_done(tx: &mpsc::Sender<Bytes>) {
    let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
}
