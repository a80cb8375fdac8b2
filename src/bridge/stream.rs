//! Chunk transform
//!
//! Feeds arbitrary-sized input chunks through a processor (normally one
//! marshalled call per segment) and re-segments them by delimiter, line
//! ending or block size. Bytes that do not complete a segment are carried
//! into the next chunk and emitted once at stream end.
//!
//! State machine:
//!
//! ```text
//!   Idle <-> Carrying --finish--> Finished
//!     \         |
//!      +--------+--failure--> Aborted
//! ```

use super::error::{BridgeError, BridgeResult};
use crate::console_log;
use futures::Stream;
use futures::ready;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Segment processor behind a stream
pub type BoxedProcessor<'a> = Box<dyn FnMut(&[u8]) -> BridgeResult<Vec<u8>> + 'a>;

/// How incoming bytes are cut into segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segmentation {
    /// Every chunk is processed as it arrives, nothing is carried
    #[default]
    Passthrough,
    /// Segments end at this byte; the delimiter is not part of a segment
    Delimiter(u8),
    /// Segments end at `\n`, `\r\n` or a lone `\r`
    Lines,
    /// Fixed-size blocks; the remainder is flushed at stream end
    Blocks {
        size: u32,
        /// Process all complete blocks of a chunk in one call
        #[serde(default)]
        coalesce: bool,
    },
}

impl Segmentation {
    pub fn validate(&self) -> BridgeResult<()> {
        match self {
            Segmentation::Blocks { size: 0, .. } => Err(BridgeError::InvalidConfig {
                reason: "block size must be positive".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No carried bytes
    Idle,
    /// Holding bytes of an incomplete segment
    Carrying,
    /// A segment failed; the stream accepts nothing more
    Aborted,
    /// Flushed
    Finished,
}

/// Segmenting stream transform over a processor
pub struct ChunkTransform<P> {
    segmentation: Segmentation,
    process: P,
    carry: Vec<u8>,
    /// Prefix of `carry` already known to hold no terminator
    scanned: usize,
    state: StreamState,
}

impl<P> ChunkTransform<P>
where
    P: FnMut(&[u8]) -> BridgeResult<Vec<u8>>,
{
    pub fn new(segmentation: Segmentation, process: P) -> BridgeResult<Self> {
        segmentation.validate()?;
        Ok(Self {
            segmentation,
            process,
            carry: Vec::new(),
            scanned: 0,
            state: StreamState::Idle,
        })
    }

    pub fn segmentation(&self) -> Segmentation {
        self.segmentation
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Bytes currently carried
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Add a chunk and process every segment it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> BridgeResult<Vec<Vec<u8>>> {
        self.check_open()?;

        let segments = match self.segmentation {
            Segmentation::Passthrough if chunk.is_empty() => Vec::new(),
            Segmentation::Passthrough => vec![chunk.to_vec()],
            Segmentation::Delimiter(delim) => {
                self.carry.extend_from_slice(chunk);
                self.split_delimited(delim)
            }
            Segmentation::Lines => {
                self.carry.extend_from_slice(chunk);
                self.split_lines()
            }
            Segmentation::Blocks { size, coalesce } => {
                self.carry.extend_from_slice(chunk);
                self.split_blocks(size as usize, coalesce)
            }
        };

        let mut out = Vec::with_capacity(segments.len());
        for segment in segments {
            out.push(self.run(&segment)?);
        }
        self.state = if self.carry.is_empty() {
            StreamState::Idle
        } else {
            StreamState::Carrying
        };
        Ok(out)
    }

    /// End of input: process the carried bytes, if any, exactly once
    pub fn finish(&mut self) -> BridgeResult<Option<Vec<u8>>> {
        if self.state == StreamState::Finished {
            return Ok(None);
        }
        self.check_open()?;

        let mut last = std::mem::take(&mut self.carry);
        self.scanned = 0;
        let segment = match self.segmentation {
            // A trailing CR still terminates its line
            Segmentation::Lines if last.last() == Some(&b'\r') => {
                last.pop();
                Some(last)
            }
            _ if last.is_empty() => None,
            _ => Some(last),
        };

        let out = match segment {
            Some(segment) => Some(self.run(&segment)?),
            None => None,
        };
        self.state = StreamState::Finished;
        Ok(out)
    }

    /// Drop carried bytes and refuse further input
    pub fn abort(&mut self) {
        self.carry.clear();
        self.scanned = 0;
        self.state = StreamState::Aborted;
    }

    /// Wrap an upstream of chunks into a stream of processed segments
    pub fn into_stream<S>(self, upstream: S) -> SegmentedStream<S, P> {
        SegmentedStream {
            upstream,
            transform: self,
            ready: VecDeque::new(),
            done: false,
        }
    }

    fn check_open(&self) -> BridgeResult<()> {
        match self.state {
            StreamState::Aborted | StreamState::Finished => Err(BridgeError::StreamAborted),
            _ => Ok(()),
        }
    }

    fn run(&mut self, segment: &[u8]) -> BridgeResult<Vec<u8>> {
        (self.process)(segment).inspect_err(|e| {
            console_log!("[stream] aborted: {}", e);
            self.abort();
        })
    }

    fn split_delimited(&mut self, delim: u8) -> Vec<Vec<u8>> {
        let mut segments = Vec::new();
        let mut start = 0;
        for (i, &byte) in self.carry.iter().enumerate().skip(self.scanned) {
            if byte == delim {
                segments.push(self.carry[start..i].to_vec());
                start = i + 1;
            }
        }
        self.carry.drain(..start);
        self.scanned = self.carry.len();
        segments
    }

    fn split_lines(&mut self) -> Vec<Vec<u8>> {
        let buf = &self.carry;
        let mut segments = Vec::new();
        let mut start = 0;
        let mut i = self.scanned;
        while i < buf.len() {
            match buf[i] {
                b'\n' => {
                    segments.push(buf[start..i].to_vec());
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    // Hold a final CR until we know whether LF follows
                    if i + 1 == buf.len() {
                        break;
                    }
                    segments.push(buf[start..i].to_vec());
                    i += if buf[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.carry.drain(..start);
        // A held CR is rescanned with the next chunk
        self.scanned = i - start;
        segments
    }

    fn split_blocks(&mut self, size: usize, coalesce: bool) -> Vec<Vec<u8>> {
        let aligned = self.carry.len() / size * size;
        if aligned == 0 {
            return Vec::new();
        }
        let span: Vec<u8> = self.carry.drain(..aligned).collect();
        if coalesce {
            vec![span]
        } else {
            span.chunks(size).map(<[u8]>::to_vec).collect()
        }
    }
}

pin_project! {
    /// Stream of processed segments over a stream of input chunks.
    ///
    /// Flushes the carry when the upstream ends and ends after the first
    /// error.
    pub struct SegmentedStream<S, P> {
        #[pin]
        upstream: S,
        transform: ChunkTransform<P>,
        ready: VecDeque<Vec<u8>>,
        done: bool,
    }
}

impl<S, P> SegmentedStream<S, P> {
    pub fn transform(&self) -> &ChunkTransform<P> {
        &self.transform
    }
}

impl<S, P, B> Stream for SegmentedStream<S, P>
where
    S: Stream<Item = B>,
    B: AsRef<[u8]>,
    P: FnMut(&[u8]) -> BridgeResult<Vec<u8>>,
{
    type Item = BridgeResult<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(segment) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(segment)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match ready!(this.upstream.as_mut().poll_next(cx)) {
                Some(chunk) => match this.transform.push(chunk.as_ref()) {
                    Ok(segments) => this.ready.extend(segments),
                    Err(e) => {
                        *this.done = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                None => {
                    *this.done = true;
                    match this.transform.finish() {
                        Ok(last) => this.ready.extend(last),
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::executor::block_on;

    fn identity(segmentation: Segmentation) -> ChunkTransform<BoxedProcessor<'static>> {
        let process: BoxedProcessor<'static> =
            Box::new(|s: &[u8]| -> BridgeResult<Vec<u8>> { Ok(s.to_vec()) });
        ChunkTransform::new(segmentation, process).unwrap()
    }

    fn run_chunks(segmentation: Segmentation, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut t = identity(segmentation);
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(t.push(chunk).unwrap());
        }
        out.extend(t.finish().unwrap());
        out
    }

    fn strings(segments: Vec<Vec<u8>>) -> Vec<String> {
        segments
            .into_iter()
            .map(|s| String::from_utf8(s).unwrap())
            .collect()
    }

    #[test]
    fn test_passthrough() {
        let out = run_chunks(Segmentation::Passthrough, &[b"ab", b"", b"c"]);
        assert_eq!(strings(out), vec!["ab", "c"]);
    }

    #[test]
    fn test_delimiter_every_split() {
        let input = b"A\nBC\nD";
        for i in 0..=input.len() {
            for j in i..=input.len() {
                let out = run_chunks(
                    Segmentation::Delimiter(b'\n'),
                    &[&input[..i], &input[i..j], &input[j..]],
                );
                assert_eq!(strings(out), vec!["A", "BC", "D"], "split at {} {}", i, j);
            }
        }
    }

    #[test]
    fn test_delimiter_trailing_and_empty() {
        let out = run_chunks(Segmentation::Delimiter(b','), &[b"a,,b,"]);
        assert_eq!(strings(out), vec!["a", "", "b"]);
    }

    #[test]
    fn test_lines_mixed_endings() {
        let input = b"line1\nline2\r\nline3\rlast";
        for i in 0..=input.len() {
            let out = run_chunks(Segmentation::Lines, &[&input[..i], &input[i..]]);
            assert_eq!(
                strings(out),
                vec!["line1", "line2", "line3", "last"],
                "split at {}",
                i
            );
        }
    }

    #[test]
    fn test_lines_cr_held_across_chunks() {
        let mut t = identity(Segmentation::Lines);
        assert!(t.push(b"a\r").unwrap().is_empty());
        assert_eq!(t.state(), StreamState::Carrying);
        assert_eq!(strings(t.push(b"\nb").unwrap()), vec!["a"]);
        assert_eq!(t.finish().unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = b"first\r\nsecond\rthird\n\nlast";
        let chunks: Vec<&[u8]> = input.chunks(1).collect();
        let out = run_chunks(Segmentation::Lines, &chunks);
        assert_eq!(strings(out), vec!["first", "second", "third", "", "last"]);

        let out = run_chunks(Segmentation::Delimiter(b'\n'), &chunks);
        assert_eq!(strings(out), vec!["first\r", "second\rthird", "", "last"]);
    }

    #[test]
    fn test_scan_resumes_after_carried_bytes() {
        let mut t = identity(Segmentation::Delimiter(b';'));
        t.push(b"abc").unwrap();
        t.push(b"de").unwrap();
        assert_eq!(t.scanned, 5);
        assert_eq!(strings(t.push(b"f;g").unwrap()), vec!["abcdef"]);
        assert_eq!(t.scanned, 1);

        let mut t = identity(Segmentation::Lines);
        t.push(b"ab\r").unwrap();
        // The held CR is looked at again
        assert_eq!(t.scanned, 2);
        assert_eq!(strings(t.push(b"\nc").unwrap()), vec!["ab"]);
        assert_eq!(t.scanned, 1);
    }

    #[test]
    fn test_lines_trailing_cr_at_end() {
        let out = run_chunks(Segmentation::Lines, &[b"x\r"]);
        assert_eq!(strings(out), vec!["x"]);
        let out = run_chunks(Segmentation::Lines, &[b"x\n"]);
        assert_eq!(strings(out), vec!["x"]);
    }

    #[test]
    fn test_blocks() {
        let seg = Segmentation::Blocks {
            size: 4,
            coalesce: false,
        };
        let out = run_chunks(seg, &[b"abc", b"defgh", b"ij"]);
        assert_eq!(strings(out), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_blocks_coalesced() {
        let seg = Segmentation::Blocks {
            size: 4,
            coalesce: true,
        };
        let out = run_chunks(seg, &[b"abc", b"defgh", b"ij"]);
        assert_eq!(strings(out), vec!["abcdefgh", "ij"]);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let seg = Segmentation::Blocks {
            size: 0,
            coalesce: false,
        };
        assert!(ChunkTransform::new(seg, |s: &[u8]| Ok(s.to_vec())).is_err());
    }

    #[test]
    fn test_flush_exactly_once() {
        let mut t = identity(Segmentation::Delimiter(b'|'));
        t.push(b"tail").unwrap();
        assert_eq!(t.carry_len(), 4);
        assert_eq!(t.finish().unwrap(), Some(b"tail".to_vec()));
        assert_eq!(t.finish().unwrap(), None);
        assert_eq!(t.state(), StreamState::Finished);
        assert_eq!(t.push(b"more"), Err(BridgeError::StreamAborted));
    }

    #[test]
    fn test_failure_aborts() {
        let mut t = ChunkTransform::new(Segmentation::Delimiter(b'\n'), |s: &[u8]| {
            if s == b"bad" {
                Err(BridgeError::ForeignCallFailed {
                    export: "upper".to_string(),
                    code: 1,
                })
            } else {
                Ok(s.to_ascii_uppercase())
            }
        })
        .unwrap();

        let err = t.push(b"ok\nbad\nlater").unwrap_err();
        assert_eq!(err.foreign_code(), Some(1));
        assert_eq!(t.state(), StreamState::Aborted);
        assert_eq!(t.carry_len(), 0);
        assert_eq!(t.push(b"x"), Err(BridgeError::StreamAborted));
        assert_eq!(t.finish(), Err(BridgeError::StreamAborted));
    }

    #[test]
    fn test_segmented_stream() {
        let chunks = futures::stream::iter(vec![b"a\nb".to_vec(), b"c\nd".to_vec()]);
        let stream = identity(Segmentation::Delimiter(b'\n')).into_stream(chunks);
        let out: Vec<_> = block_on(stream.collect());
        let out: Vec<Vec<u8>> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(strings(out), vec!["a", "bc", "d"]);
    }

    #[test]
    fn test_segmented_stream_ends_after_error() {
        let chunks = futures::stream::iter(vec!["1,2", ",x,", "3"]);
        let t = ChunkTransform::new(Segmentation::Delimiter(b','), |s: &[u8]| {
            if s == b"x" {
                Err(BridgeError::ForeignCallFailed {
                    export: "num".to_string(),
                    code: 2,
                })
            } else {
                Ok(s.to_vec())
            }
        })
        .unwrap();
        let out: Vec<_> = block_on(t.into_stream(chunks).collect());
        // "2" shares a chunk with the failing segment and is not emitted
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok(b"1".to_vec()));
        assert_eq!(out[1].as_ref().unwrap_err().foreign_code(), Some(2));
    }

    #[test]
    fn test_segmentation_serde() {
        let seg: Segmentation = serde_json::from_str(r#"{"blocks":{"size":16}}"#).unwrap();
        assert_eq!(
            seg,
            Segmentation::Blocks {
                size: 16,
                coalesce: false
            }
        );
        let seg: Segmentation = serde_json::from_str(r#"{"delimiter":10}"#).unwrap();
        assert_eq!(seg, Segmentation::Delimiter(b'\n'));
        let seg: Segmentation = serde_json::from_str(r#""lines""#).unwrap();
        assert_eq!(seg, Segmentation::Lines);
    }
}
