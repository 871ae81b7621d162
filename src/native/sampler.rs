//! Sampler chain construction.
//!
//! Fixed order: temperature, top-k, top-p, penalties when any are set, then
//! the seeded distribution draw. The external frequency/presence penalties
//! arrive on the signed chat-API scale and are translated to the native
//! multiplier here.

use std::ptr::NonNull;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::Context;
use crate::error::{Error, Result};
use crate::types::GenerationOptions;

/// History window for the repeat/frequency/presence penalty sampler.
const PENALTY_LAST_N: i32 = 64;

pub struct Sampler {
    ptr: NonNull<llama_cpp_sys_2::llama_sampler>,
}

impl Sampler {
    pub fn from_options(options: &GenerationOptions) -> Result<Self> {
        let params = unsafe { llama_cpp_sys_2::llama_sampler_chain_default_params() };
        let chain = unsafe { llama_cpp_sys_2::llama_sampler_chain_init(params) };
        let chain = NonNull::new(chain).ok_or_else(|| Error::Inference {
            stage: "sampler",
            message: "sampler chain allocation failed".into(),
        })?;

        unsafe {
            llama_cpp_sys_2::llama_sampler_chain_add(
                chain.as_ptr(),
                llama_cpp_sys_2::llama_sampler_init_temp(options.temperature),
            );
            llama_cpp_sys_2::llama_sampler_chain_add(
                chain.as_ptr(),
                llama_cpp_sys_2::llama_sampler_init_top_k(options.top_k as i32),
            );
            llama_cpp_sys_2::llama_sampler_chain_add(
                chain.as_ptr(),
                llama_cpp_sys_2::llama_sampler_init_top_p(options.top_p, 1),
            );
            if options.any_penalty_set() {
                llama_cpp_sys_2::llama_sampler_chain_add(
                    chain.as_ptr(),
                    llama_cpp_sys_2::llama_sampler_init_penalties(
                        PENALTY_LAST_N,
                        options.repeat_penalty.unwrap_or(1.0),
                        native_penalty(options.frequency_penalty),
                        native_penalty(options.presence_penalty),
                    ),
                );
            }
            llama_cpp_sys_2::llama_sampler_chain_add(
                chain.as_ptr(),
                llama_cpp_sys_2::llama_sampler_init_dist(options.seed.unwrap_or_else(clock_seed)),
            );
        }

        debug!(
            temperature = options.temperature,
            top_k = options.top_k,
            top_p = options.top_p,
            penalties = options.any_penalty_set(),
            seed = ?options.seed,
            "sampler chain built"
        );
        Ok(Self { ptr: chain })
    }

    /// Draw the next token from the logits at `idx` (-1 for the last).
    pub fn sample(&mut self, ctx: &Context, idx: i32) -> llama_cpp_sys_2::llama_token {
        unsafe { llama_cpp_sys_2::llama_sampler_sample(self.ptr.as_ptr(), ctx.as_ptr(), idx) }
    }

    /// Record an accepted token in penalty history.
    pub fn accept(&mut self, token: llama_cpp_sys_2::llama_token) {
        unsafe { llama_cpp_sys_2::llama_sampler_accept(self.ptr.as_ptr(), token) };
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { llama_cpp_sys_2::llama_sampler_free(self.ptr.as_ptr()) };
    }
}

/// High-resolution timestamp seed for nondeterministic sampling.
fn clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

/// Signed chat-API penalty → native multiplier.
/// `None` disables; `ext >= 0` maps to `1 - ext`, negative to `1 + |ext|`.
pub fn native_penalty(ext: Option<f32>) -> f32 {
    match ext {
        None => 0.0,
        Some(e) if e >= 0.0 => 1.0 - e,
        Some(e) => 1.0 + e.abs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty_translation_boundaries() {
        assert_eq!(native_penalty(Some(-2.0)), 3.0);
        assert_eq!(native_penalty(Some(-1.0)), 2.0);
        assert_eq!(native_penalty(Some(0.0)), 1.0);
        assert_eq!(native_penalty(Some(1.0)), 0.0);
        assert_eq!(native_penalty(Some(2.0)), -1.0);
    }

    #[test]
    fn test_penalty_none_disables() {
        assert_eq!(native_penalty(None), 0.0);
    }

    #[test]
    fn test_clock_seed_in_range() {
        // Sub-second nanos always fit a u32.
        let seed = clock_seed();
        assert!(seed < 1_000_000_000);
    }
}
