//! Test helpers shared by unit tests

use crate::transport::FrameWriter;
use crate::{ProtocolError, Result};

/// [`FrameWriter`] that records every write
#[derive(Debug, Default)]
pub struct RecordingWriter {
    writes: Vec<Vec<u8>>,
    max_write_size: usize,
    fail: bool,
}

impl RecordingWriter {
    pub fn new(max_write_size: usize) -> Self {
        Self {
            writes: Vec::new(),
            max_write_size,
            fail: false,
        }
    }

    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// All written bytes, in order
    pub fn joined(&self) -> Vec<u8> {
        self.writes.concat()
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail = fail;
    }
}

impl FrameWriter for RecordingWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.fail {
            return Err(ProtocolError::Transport("write rejected".to_string()));
        }
        self.writes.push(bytes.to_vec());
        Ok(())
    }

    fn max_write_size(&self) -> usize {
        self.max_write_size
    }
}
