//! Reassembles arbitrary output chunks into complete lines.

/// Buffers partial reads until a newline arrives.
///
/// Every byte pushed ends up in exactly one emitted line, in order. The
/// newline itself is not part of the line. A trailing partial line stays
/// buffered until [`LineReassembler::finish`] is called at teardown.
#[derive(Debug, Default)]
pub struct LineReassembler {
    buffer: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = end + 1;
        }
        self.buffer.drain(..start);

        lines
    }

    /// The partial line currently buffered, if any.
    pub fn pending(&self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buffer).into_owned())
        }
    }

    /// Flush the buffered partial line. Called once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.pending();
        self.buffer.clear();
        rest
    }
}
