use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

const RAW_PREVIEW_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("line {line_number} is not valid utf-8")]
    InvalidUtf8 { line_number: u64 },
    #[error("line {line_number} is not valid json: {error}")]
    InvalidJson {
        line_number: u64,
        #[source]
        error: serde_json::Error,
    },
    #[error("failed to serialize outbound message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reassembles newline-delimited JSON from arbitrarily chunked bytes.
///
/// The only state is the trailing partial line; a malformed line is logged
/// and dropped without disturbing the lines after it.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
    line_count: u64,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            if let Some(value) = self.decode_logged(&line[..line.len() - 1]) {
                values.push(value);
            }
        }
        values
    }

    /// Decodes whatever is left in the buffer once the stream has ended.
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buffer);
        self.decode_logged(&rest).into_iter().collect()
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode_logged(&mut self, line: &[u8]) -> Option<Value> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        self.line_count += 1;
        match decode_line(line, self.line_count) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    line_number = self.line_count,
                    raw = %preview(line),
                    "agent stdout: dropping undecodable line"
                );
                None
            }
        }
    }
}

pub fn decode_line(line: &[u8], line_number: u64) -> Result<Value, CodecError> {
    let text = std::str::from_utf8(line).map_err(|_| CodecError::InvalidUtf8 { line_number })?;
    serde_json::from_str(text.trim()).map_err(|error| CodecError::InvalidJson { line_number, error })
}

fn preview(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.chars().count() > RAW_PREVIEW_LIMIT {
        let cut: String = trimmed.chars().take(RAW_PREVIEW_LIMIT).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}
