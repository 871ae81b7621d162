//! Token batch for decode dispatch.

use std::ptr::NonNull;

use crate::error::{Error, Result};

pub struct Batch {
    raw: llama_cpp_sys_2::llama_batch,
    capacity: usize,
    len: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Result<Self> {
        let raw = unsafe { llama_cpp_sys_2::llama_batch_init(capacity as i32, 0, 1) };
        NonNull::new(raw.token).ok_or_else(|| Error::Inference {
            stage: "batch",
            message: format!("batch allocation failed (capacity {capacity})"),
        })?;
        Ok(Self {
            raw,
            capacity,
            len: 0,
        })
    }

    /// Append one token at `pos` in sequence 0.
    pub fn add(
        &mut self,
        token: llama_cpp_sys_2::llama_token,
        pos: i32,
        logits: bool,
    ) -> Result<()> {
        if self.len >= self.capacity {
            return Err(Error::Inference {
                stage: "batch",
                message: format!("batch full at {} tokens", self.capacity),
            });
        }
        let i = self.len;
        unsafe {
            *self.raw.token.add(i) = token;
            *self.raw.pos.add(i) = pos;
            *self.raw.n_seq_id.add(i) = 1;
            let seq_ptr = *self.raw.seq_id.add(i);
            *seq_ptr = 0;
            *self.raw.logits.add(i) = i8::from(logits);
        }
        self.len += 1;
        self.raw.n_tokens = self.len as i32;
        Ok(())
    }

    /// Append a token run starting at `start_pos`, requesting logits only
    /// for the final token.
    pub fn add_prompt(
        &mut self,
        tokens: &[llama_cpp_sys_2::llama_token],
        start_pos: i32,
    ) -> Result<()> {
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            self.add(token, start_pos + i as i32, i == last)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.raw.n_tokens = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_raw(&self) -> llama_cpp_sys_2::llama_batch {
        self.raw
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        unsafe { llama_cpp_sys_2::llama_batch_free(self.raw) };
    }
}
