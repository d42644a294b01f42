//! Incremental Server-Sent Events decoder.
//!
//! Network chunks do not respect line boundaries, so bytes are buffered until a full line is
//! available. Only `data:` fields are surfaced; `[DONE]` ends the stream.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk; returns the frames completed by it. Nothing is returned after `Done`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                self.done = true;
                self.buffer.clear();
                frames.push(SseFrame::Done);
                break;
            }
            if !payload.is_empty() {
                frames.push(SseFrame::Data(payload.to_string()));
            }
        }
        frames
    }
}
