use bytes::BytesMut;
use serde_json::{Map, Value};
use tokio_util::codec::Decoder;

use super::state::Report;
use crate::error::MalformedFrame;

/// Longest line accepted before the codec gives up on it.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How much of an oversized line is kept for the log.
const PREVIEW_LENGTH: usize = 128;

/// A frame read from the device stream or from a command's output.
#[derive(Clone, Debug, PartialEq)]
pub enum RxFrame {
    Report(Report),
    /// A raw-buffer echo from the transport; carries no device state.
    Echo,
    Malformed(MalformedFrame),
}

impl RxFrame {
    /// Decode a single line. Blank lines decode to `None`.
    pub fn decode(line: &[u8]) -> Option<RxFrame> {
        let line = trim(line);

        if line.is_empty() {
            return None;
        }

        let malformed = |reason: String| {
            RxFrame::Malformed(MalformedFrame {
                line: String::from_utf8_lossy(line).into_owned(),
                reason,
            })
        };

        let frame = match serde_json::from_slice::<Value>(line) {
            Ok(Value::Object(map)) if is_buffer_echo(&map) => RxFrame::Echo,
            Ok(Value::Object(map)) => RxFrame::Report(map),
            Ok(_) => malformed("not a JSON object".to_string()),
            Err(err) => malformed(err.to_string()),
        };

        Some(frame)
    }

    pub fn report(self) -> Option<Report> {
        match self {
            RxFrame::Report(report) => Some(report),
            _ => None,
        }
    }
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |idx| idx + 1);
    &line[start..end]
}

/// `{"type": "Buffer", "data": [...]}`
fn is_buffer_echo(map: &Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str) == Some("Buffer")
        && map.get("data").map_or(false, Value::is_array)
}

/// Splits a byte stream into newline-delimited JSON frames.
///
/// Undecodable lines are yielded as [`RxFrame::Malformed`] rather than
/// failing the stream.
pub struct FrameCodec {
    max_length: usize,

    /// Offset to resume the newline search from.
    next_index: usize,

    /// Dropping the remainder of an oversized line.
    discarding: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        FrameCodec {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn oversized(&self, line: &[u8]) -> RxFrame {
        RxFrame::Malformed(MalformedFrame {
            line: String::from_utf8_lossy(&line[..PREVIEW_LENGTH.min(line.len())]).into_owned(),
            reason: format!("line exceeds {} bytes", self.max_length),
        })
    }

    /// Decode every frame in a complete buffer, such as a command's output.
    pub fn decode_all(output: &[u8]) -> Vec<RxFrame> {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::from(output);
        let mut frames = Vec::new();

        while let Ok(Some(frame)) = codec.decode_eof(&mut src) {
            frames.push(frame);
        }

        frames
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = RxFrame;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match newline {
                Some(idx) => {
                    let line = src.split_to(idx + 1);
                    self.next_index = 0;

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }

                    if idx > self.max_length {
                        return Ok(Some(self.oversized(&line)));
                    }

                    match RxFrame::decode(&line) {
                        Some(frame) => return Ok(Some(frame)),
                        None => continue,
                    }
                }

                None if self.discarding => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }

                None if src.len() > self.max_length => {
                    let frame = self.oversized(src);

                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;

                    return Ok(Some(frame));
                }

                // need more data
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // final line without a trailing newline
        let line = src.split();
        self.next_index = 0;

        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }

        Ok(RxFrame::decode(&line))
    }
}
