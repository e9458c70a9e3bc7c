//! Delimiter-separated text blocks.
//!
//! A line that starts with the delimiter closes the block accumulated so
//! far and opens the next one. The delimiter prefix is stripped from every
//! block, blocks are trimmed and empty ones are dropped. The first block is
//! emitted raw; later blocks are HTML and are rendered to [`StyledText`].
//!
//! [`StyledText`]: super::StyledText

use super::{html::html_to_styled, LineSplitter, TextBlock};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const BLOCK_CHANNEL_CAPACITY: usize = 64;

/// Line-driven block state machine.
#[derive(Debug)]
pub struct DelimitedBlockParser {
    delimiter: String,
    buffer: String,
    first_emitted: bool,
}

impl DelimitedBlockParser {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            buffer: String::new(),
            first_emitted: false,
        }
    }

    /// Feed one line (without its terminator). Returns the block this line
    /// closed, if any.
    pub fn push_line(&mut self, line: &str) -> Option<TextBlock> {
        let closed = if line.starts_with(&self.delimiter) {
            self.take_block()
        } else {
            None
        };
        self.buffer.push_str(line);
        self.buffer.push('\n');
        closed
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<TextBlock> {
        self.take_block()
    }

    fn take_block(&mut self) -> Option<TextBlock> {
        let raw = std::mem::take(&mut self.buffer);
        let body = raw.strip_prefix(self.delimiter.as_str()).unwrap_or(&raw);
        let body = body.trim();
        if body.is_empty() {
            return None;
        }

        if self.first_emitted {
            let styled = html_to_styled(body);
            if styled.is_empty() {
                return None;
            }
            Some(TextBlock::Styled(styled))
        } else {
            self.first_emitted = true;
            Some(TextBlock::Raw(body.to_string()))
        }
    }
}

/// Drive a response body through a [`DelimitedBlockParser`].
///
/// Blocks are produced lazily as lines complete. A transport error ends the
/// stream with one raw block carrying the error message.
pub fn read_delimited_blocks<S, B, E>(body: S, delimiter: String) -> ReceiverStream<TextBlock>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
    tokio::spawn(drive(body, delimiter, tx));
    ReceiverStream::new(rx)
}

async fn drive<S, B, E>(body: S, delimiter: String, tx: mpsc::Sender<TextBlock>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut lines = LineSplitter::new();
    let mut parser = DelimitedBlockParser::new(delimiter);
    let mut emitted = 0usize;

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, emitted, "Delimited stream failed");
                let _ = tx.send(TextBlock::Raw(e.to_string())).await;
                return;
            }
        };
        for line in lines.push(bytes.as_ref()) {
            if let Some(block) = parser.push_line(&line) {
                emitted += 1;
                if tx.send(block).await.is_err() {
                    tracing::debug!("Block receiver dropped, abandoning stream");
                    return;
                }
            }
        }
    }

    if let Some(line) = lines.finish() {
        if let Some(block) = parser.push_line(&line) {
            emitted += 1;
            let _ = tx.send(block).await;
        }
    }
    if let Some(block) = parser.finish() {
        emitted += 1;
        let _ = tx.send(block).await;
    }
    tracing::debug!(blocks = emitted, "Delimited stream complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> Vec<TextBlock> {
        let mut parser = DelimitedBlockParser::new("$_$");
        let mut out: Vec<TextBlock> = input.lines().filter_map(|l| parser.push_line(l)).collect();
        out.extend(parser.finish());
        out
    }

    #[test]
    fn first_block_raw_then_styled() {
        let blocks = parse_all("$_$\nhello\n$_$\n<b>world</b>\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], TextBlock::Raw("hello".into()));
        assert!(matches!(&blocks[1], TextBlock::Styled(s) if s.text == "world"));
    }

    #[test]
    fn multi_line_blocks_are_joined() {
        let blocks = parse_all("intro line\nsecond line\n$_$ <p>answer</p>\n<p>more</p>");
        assert_eq!(blocks[0].text(), "intro line\nsecond line");
        assert!(blocks[1].text().contains("answer"));
        assert!(blocks[1].text().contains("more"));
    }

    #[test]
    fn consecutive_delimiters_skip_empty_blocks() {
        let blocks = parse_all("$_$\n$_$\n$_$\nonly\n$_$\n");
        assert_eq!(blocks, vec![TextBlock::Raw("only".into())]);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert!(parse_all("").is_empty());
    }

    #[test]
    fn custom_delimiter() {
        let mut parser = DelimitedBlockParser::new("--");
        assert!(parser.push_line("a").is_none());
        assert_eq!(parser.push_line("--b"), Some(TextBlock::Raw("a".into())));
        assert!(matches!(parser.finish(), Some(TextBlock::Styled(s)) if s.text == "b"));
    }

    #[tokio::test]
    async fn async_driver_handles_split_reads() {
        let reads: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"$_$\nhel".to_vec()),
            Ok(b"lo\n$_".to_vec()),
            Ok(b"$\n<b>world</b>".to_vec()),
        ];
        let blocks: Vec<TextBlock> =
            read_delimited_blocks(futures_util::stream::iter(reads), "$_$".into())
                .collect()
                .await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text(), "hello");
        assert_eq!(blocks[1].text(), "world");
    }

    #[tokio::test]
    async fn transport_error_emits_message_and_ends() {
        let reads: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"$_$\nhello\n".to_vec()),
            Err("connection reset".into()),
            Ok(b"$_$\nnever\n".to_vec()),
        ];
        let blocks: Vec<TextBlock> =
            read_delimited_blocks(futures_util::stream::iter(reads), "$_$".into())
                .collect()
                .await;
        assert_eq!(blocks, vec![TextBlock::Raw("connection reset".into())]);
    }

    #[tokio::test]
    async fn reader_runs_inside_spawned_task() {
        let reads = vec![
            Ok::<_, std::io::Error>(&b"$_$
first
$_"[..]),
            Ok(&b"$
second
"[..]),
        ];
        let blocks = tokio::spawn(async move {
            read_delimited_blocks(futures_util::stream::iter(reads), "$_$".into())
                .collect::<Vec<TextBlock>>()
                .await
        })
        .await
        .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].text(), "second");
    }
}
