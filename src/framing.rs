//! Whole-line framing over a raw text transport.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::warn;

use crate::error::DecodeError;

/// Turn arbitrarily chunked text into whole lines.
///
/// Each line is emitted without its terminating newline. A non-empty
/// trailing buffer at upstream end is discarded: well-formed streams end
/// with a newline after the last frame.
pub fn lines<S>(chunks: S) -> Lines
where
    S: Stream<Item = Result<String, DecodeError>> + Send + 'static,
{
    Lines {
        upstream: Some(chunks.boxed()),
        buffer: String::new(),
        ready: VecDeque::new(),
    }
}

/// The stream returned by [`lines`].
pub struct Lines {
    upstream: Option<BoxStream<'static, Result<String, DecodeError>>>,
    buffer: String,
    ready: VecDeque<String>,
}

impl Stream for Lines {
    type Item = Result<String, DecodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(line) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }
            let Some(upstream) = this.upstream.as_mut() else {
                return Poll::Ready(None);
            };
            match upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.push_str(&chunk);
                    while let Some(position) = this.buffer.find('\n') {
                        let mut line: String = this.buffer.drain(..=position).collect();
                        line.pop();
                        this.ready.push_back(line);
                    }
                }
                Poll::Ready(Some(Err(error))) => {
                    this.upstream = None;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.upstream = None;
                    if !this.buffer.is_empty() {
                        warn!(
                            length = this.buffer.len(),
                            "discarding trailing partial frame"
                        );
                        this.buffer.clear();
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    async fn collect(chunks: Vec<&str>) -> Vec<String> {
        let chunks: Vec<Result<String, DecodeError>> =
            chunks.into_iter().map(|c| Ok(c.to_string())).collect();
        lines(stream::iter(chunks))
            .map(|line| line.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn splits_across_chunk_boundaries() {
        let out = collect(vec!["ab", "c\nde", "f\n"]).await;
        assert_eq!(out, ["abc", "def"]);
    }

    #[tokio::test]
    async fn emits_multiple_lines_from_one_chunk() {
        let out = collect(vec!["a\nb\nc\n"]).await;
        assert_eq!(out, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn discards_trailing_partial_line() {
        let out = collect(vec!["a\npartial"]).await;
        assert_eq!(out, ["a"]);
    }

    #[tokio::test]
    async fn empty_lines_are_preserved() {
        let out = collect(vec!["a\n\nb\n"]).await;
        assert_eq!(out, ["a", "", "b"]);
    }

    #[tokio::test]
    async fn transport_error_passes_through() {
        let chunks: Vec<Result<String, DecodeError>> = vec![
            Ok("a\n".to_string()),
            Err(DecodeError::Transport("reset".to_string())),
        ];
        let out: Vec<_> = lines(stream::iter(chunks)).collect().await;
        assert!(matches!(out[0], Ok(ref line) if line == "a"));
        assert!(matches!(out[1], Err(DecodeError::Transport(_))));
    }
}
