//! Loaded-model handle.
//!
//! Owns the native `llama_model` pointer and exposes the read-side surface:
//! vocabulary, special tokens, tokenization, piece conversion, and native
//! chat-template application. Read operations on a model are thread-safe.

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::Message;

/// Extra space over the byte length when sizing the tokenizer buffer.
const TOKENIZE_HEADROOM: usize = 256;

pub struct Model {
    ptr: NonNull<llama_cpp_sys_2::llama_model>,
    path: PathBuf,
    n_ctx_train: u32,
    n_embd: i32,
    bos: llama_cpp_sys_2::llama_token,
    eos: llama_cpp_sys_2::llama_token,
    pad: llama_cpp_sys_2::llama_token,
}

// Read operations (tokenize, token lookup, template access) are safe from
// any thread; mutation only happens at load/free which this type owns.
unsafe impl Send for Model {}
unsafe impl Sync for Model {}

impl Model {
    /// Load a GGUF model. The file must exist and be non-empty.
    pub fn load(path: &Path, n_gpu_layers: u32) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|_| Error::ModelLoad(format!("model file not found: {}", path.display())))?;
        if meta.len() == 0 {
            return Err(Error::ModelLoad(format!(
                "model file is empty: {}",
                path.display()
            )));
        }

        let c_path = CString::new(path.to_string_lossy().into_owned())
            .map_err(|_| Error::ModelLoad("model path contains NUL".into()))?;

        let mut params = unsafe { llama_cpp_sys_2::llama_model_default_params() };
        params.n_gpu_layers = n_gpu_layers as i32;

        info!(path = %path.display(), n_gpu_layers, "loading model");
        let raw = unsafe { llama_cpp_sys_2::llama_model_load_from_file(c_path.as_ptr(), params) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::ModelLoad(format!("native load failed: {}", path.display())))?;

        let vocab = unsafe { llama_cpp_sys_2::llama_model_get_vocab(ptr.as_ptr()) };
        let model = Self {
            ptr,
            path: path.to_path_buf(),
            n_ctx_train: unsafe { llama_cpp_sys_2::llama_model_n_ctx_train(ptr.as_ptr()) } as u32,
            n_embd: unsafe { llama_cpp_sys_2::llama_model_n_embd(ptr.as_ptr()) },
            bos: unsafe { llama_cpp_sys_2::llama_vocab_bos(vocab) },
            eos: unsafe { llama_cpp_sys_2::llama_vocab_eos(vocab) },
            pad: unsafe { llama_cpp_sys_2::llama_vocab_pad(vocab) },
        };
        debug!(
            n_ctx_train = model.n_ctx_train,
            n_embd = model.n_embd,
            n_vocab = model.n_vocab(),
            "model loaded"
        );
        Ok(model)
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_cpp_sys_2::llama_model {
        self.ptr.as_ptr()
    }

    fn vocab(&self) -> *const llama_cpp_sys_2::llama_vocab {
        unsafe { llama_cpp_sys_2::llama_model_get_vocab(self.ptr.as_ptr()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Context length the model was trained with.
    pub fn n_ctx_train(&self) -> u32 {
        self.n_ctx_train
    }

    pub fn n_embd(&self) -> i32 {
        self.n_embd
    }

    pub fn n_vocab(&self) -> i32 {
        unsafe { llama_cpp_sys_2::llama_vocab_n_tokens(self.vocab()) }
    }

    pub fn token_bos(&self) -> llama_cpp_sys_2::llama_token {
        self.bos
    }

    pub fn token_eos(&self) -> llama_cpp_sys_2::llama_token {
        self.eos
    }

    pub fn token_pad(&self) -> llama_cpp_sys_2::llama_token {
        self.pad
    }

    pub fn is_eog(&self, token: llama_cpp_sys_2::llama_token) -> bool {
        unsafe { llama_cpp_sys_2::llama_vocab_is_eog(self.vocab(), token) }
    }

    /// Tokenize text. The buffer starts at `len + 256` and grows once if the
    /// native call reports the required size via a negative return.
    pub fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<llama_cpp_sys_2::llama_token>> {
        let c_text = CString::new(text)
            .map_err(|_| Error::Tokenization("prompt contains NUL byte".into()))?;

        let mut tokens = vec![0 as llama_cpp_sys_2::llama_token; text.len() + TOKENIZE_HEADROOM];
        let n = unsafe {
            llama_cpp_sys_2::llama_tokenize(
                self.vocab(),
                c_text.as_ptr(),
                text.len() as i32,
                tokens.as_mut_ptr(),
                tokens.len() as i32,
                add_special,
                parse_special,
            )
        };

        let n = if n < 0 {
            // Negative return carries the required token count.
            tokens.resize((-n) as usize, 0);
            let retry = unsafe {
                llama_cpp_sys_2::llama_tokenize(
                    self.vocab(),
                    c_text.as_ptr(),
                    text.len() as i32,
                    tokens.as_mut_ptr(),
                    tokens.len() as i32,
                    add_special,
                    parse_special,
                )
            };
            if retry < 0 {
                return Err(Error::Tokenization(format!(
                    "tokenizer returned {retry} after resize"
                )));
            }
            retry
        } else {
            n
        };

        tokens.truncate(n as usize);
        Ok(tokens)
    }

    /// Convert a token to its text piece, growing the buffer on demand.
    pub fn token_to_piece(&self, token: llama_cpp_sys_2::llama_token) -> Result<String> {
        let mut buf = vec![0u8; 128];
        let mut n = unsafe {
            llama_cpp_sys_2::llama_token_to_piece(
                self.vocab(),
                token,
                buf.as_mut_ptr().cast(),
                buf.len() as i32,
                0,
                true,
            )
        };
        if n < 0 {
            buf.resize((-n) as usize, 0);
            n = unsafe {
                llama_cpp_sys_2::llama_token_to_piece(
                    self.vocab(),
                    token,
                    buf.as_mut_ptr().cast(),
                    buf.len() as i32,
                    0,
                    true,
                )
            };
            if n < 0 {
                return Err(Error::Inference {
                    stage: "token-to-piece",
                    message: format!("conversion failed for token {token}"),
                });
            }
        }
        buf.truncate(n as usize);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// The model's embedded chat template, when it carries one.
    pub fn chat_template(&self) -> Option<String> {
        let raw = unsafe {
            llama_cpp_sys_2::llama_model_chat_template(self.ptr.as_ptr(), std::ptr::null())
        };
        if raw.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }

    /// Apply the native chat template to a message list, with the assistant
    /// turn opener appended when `add_assistant` is set. Two passes: the
    /// first sizes the buffer, the second fills it.
    pub fn apply_chat_template(&self, messages: &[Message], add_assistant: bool) -> Result<String> {
        let template = self.chat_template().ok_or_else(|| Error::Validation(
            "model has no embedded chat template".into(),
        ))?;
        let c_template = CString::new(template)
            .map_err(|_| Error::Validation("chat template contains NUL".into()))?;

        // Role and content CStrings must outlive the native array.
        let mut marshalled = Vec::with_capacity(messages.len());
        for msg in messages {
            let role = CString::new(msg.role.as_str()).expect("fixed role strings have no NUL");
            let content = CString::new(msg.content.as_deref().unwrap_or_default())
                .map_err(|_| Error::Validation("message content contains NUL".into()))?;
            marshalled.push((role, content));
        }
        let chat: Vec<llama_cpp_sys_2::llama_chat_message> = marshalled
            .iter()
            .map(|(role, content)| llama_cpp_sys_2::llama_chat_message {
                role: role.as_ptr(),
                content: content.as_ptr(),
            })
            .collect();

        let mut buf = vec![0u8; est_template_len(messages)];
        let mut n = unsafe {
            llama_cpp_sys_2::llama_chat_apply_template(
                c_template.as_ptr(),
                chat.as_ptr(),
                chat.len(),
                add_assistant,
                buf.as_mut_ptr().cast(),
                buf.len() as i32,
            )
        };
        if n < 0 {
            return Err(Error::Validation(format!(
                "chat template application failed ({n})"
            )));
        }
        if n as usize > buf.len() {
            buf.resize(n as usize, 0);
            n = unsafe {
                llama_cpp_sys_2::llama_chat_apply_template(
                    c_template.as_ptr(),
                    chat.as_ptr(),
                    chat.len(),
                    add_assistant,
                    buf.as_mut_ptr().cast(),
                    buf.len() as i32,
                )
            };
            if n < 0 {
                return Err(Error::Validation(format!(
                    "chat template application failed on second pass ({n})"
                )));
            }
        }
        buf.truncate(n as usize);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "freeing model");
        unsafe { llama_cpp_sys_2::llama_model_free(self.ptr.as_ptr()) };
    }
}

fn est_template_len(messages: &[Message]) -> usize {
    let content: usize = messages
        .iter()
        .map(|m| m.content.as_deref().unwrap_or_default().len())
        .sum();
    content * 2 + 512
}
