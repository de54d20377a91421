use crate::readings::RejectReason;

/// Longest line kept while waiting for its newline. A device that never
/// sends one would otherwise grow the buffer without bound.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into newline-delimited text frames.
///
/// Works on bytes so a UTF-8 sequence split across two reads is reassembled
/// before decoding.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every complete, non-blank line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, RejectReason>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(newline) = rest.iter().position(|byte| *byte == b'\n') {
            let (head, tail) = rest.split_at(newline);
            rest = &tail[1..];

            if self.discarding {
                // Tail of an oversized line; already reported.
                self.discarding = false;
                self.buffer.clear();
                continue;
            }

            if self.buffer.len() + head.len() > MAX_LINE_BYTES {
                self.buffer.clear();
                frames.push(Err(oversized()));
                continue;
            }
            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            if let Some(frame) = decode_line(line) {
                frames.push(frame);
            }
        }

        if !self.discarding {
            if self.buffer.len() + rest.len() > MAX_LINE_BYTES {
                self.buffer.clear();
                self.discarding = true;
                frames.push(Err(oversized()));
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Bytes held for an unfinished line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn oversized() -> RejectReason {
    RejectReason::UnparsableFrame(format!("line exceeds {MAX_LINE_BYTES} bytes"))
}

fn decode_line(line: Vec<u8>) -> Option<Result<String, RejectReason>> {
    match String::from_utf8(line) {
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(Ok(trimmed.to_string()))
            }
        }
        Err(err) => Some(Err(RejectReason::UnparsableFrame(format!(
            "line is not valid UTF-8: {}",
            err.utf8_error()
        )))),
    }
}
