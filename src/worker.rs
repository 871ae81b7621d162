//! Persistent inference worker.
//!
//! One long-lived OS thread owns the native library: the model pool, the
//! LoRA manager, and every context ever created. Requests arrive over a
//! channel and are processed strictly one at a time; responses multiplex
//! over a single return channel and a dispatcher routes them by correlation
//! id into per-request streams. Serializing everything removes the whole
//! class of races between model loads and backend registration at a
//! throughput cost that does not matter for on-device inference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::native::{backend, Batch, Context, ContextParams, LoraManager, Model, ModelPool, Sampler};
use crate::template::ChatTemplate;
use crate::types::{Embedding, GenerationOptions, Message};

/// Prompt input: a message list formatted by the worker, or text the caller
/// already formatted.
#[derive(Debug, Clone)]
pub enum PromptInput {
    Messages(Vec<Message>),
    Prompt(String),
}

/// Where the worker finds the model for a request.
#[derive(Clone)]
pub enum RequestSource {
    /// Load (or share) through the worker-owned pool.
    Path(PathBuf),
    /// A handle the caller already owns; the pool is not consulted.
    Handle(Arc<Model>),
}

impl std::fmt::Debug for RequestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            RequestSource::Handle(m) => f.debug_tuple("Handle").field(&m.path()).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoraRequest {
    pub path: PathBuf,
    pub scale: f32,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub source: RequestSource,
    pub input: PromptInput,
    pub stop_tokens: Vec<String>,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    pub n_threads: Option<i32>,
    pub options: GenerationOptions,
    pub lora: Option<LoraRequest>,
}

impl InferenceRequest {
    pub fn new(source: RequestSource, input: PromptInput) -> Self {
        Self {
            source,
            input,
            stop_tokens: Vec::new(),
            n_ctx: 4096,
            n_batch: 512,
            n_gpu_layers: 0,
            n_threads: None,
            options: GenerationOptions::default(),
            lora: None,
        }
    }
}

/// Typed responses for one request. For a given id, tokens arrive in
/// generation order and the terminal event is last.
#[derive(Debug)]
pub enum WorkerEvent {
    Token(String),
    Done {
        prompt_tokens: u32,
        generated_tokens: u32,
    },
    Failed(Error),
}

struct Envelope {
    id: u64,
    request: InferenceRequest,
}

struct Response {
    id: u64,
    event: WorkerEvent,
}

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<WorkerEvent>>>>;

/// Client handle to the worker. Cheap to clone via `Arc`; inject one per
/// runtime context, or let each engine spawn its own lazily.
pub struct InferenceWorker {
    request_tx: Sender<Envelope>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl InferenceWorker {
    /// Start the worker and dispatcher threads.
    pub fn spawn() -> Arc<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<Envelope>();
        let (response_tx, response_rx) = crossbeam_channel::unbounded::<Response>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        thread::Builder::new()
            .name("llamakit-worker".into())
            .spawn(move || worker_loop(request_rx, response_tx))
            .expect("failed to spawn inference worker thread");

        let dispatcher_pending = Arc::clone(&pending);
        thread::Builder::new()
            .name("llamakit-dispatch".into())
            .spawn(move || dispatch_loop(response_rx, dispatcher_pending))
            .expect("failed to spawn dispatcher thread");

        Arc::new(Self {
            request_tx,
            pending,
            next_id: AtomicU64::new(1),
        })
    }

    /// Queue a request and return its response stream. Dropping the receiver
    /// discards remaining responses; the in-flight native call is never
    /// interrupted.
    pub fn submit(&self, request: InferenceRequest) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        if self.request_tx.send(Envelope { id, request }).is_err() {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(WorkerEvent::Failed(Error::WorkerClosed(
                    "worker thread has exited".into(),
                )));
            }
        }
        rx
    }
}

/// Routes multiplexed responses into per-request streams. A send failure
/// means the client dropped its stream: the entry is unregistered and later
/// responses for that id are discarded silently.
fn dispatch_loop(response_rx: Receiver<Response>, pending: PendingMap) {
    while let Ok(Response { id, event }) = response_rx.recv() {
        let terminal = matches!(event, WorkerEvent::Done { .. } | WorkerEvent::Failed(_));
        let mut map = pending.lock().expect("pending map poisoned");
        match map.get(&id) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!(id, "client dropped stream; discarding remaining responses");
                    map.remove(&id);
                } else if terminal {
                    map.remove(&id);
                }
            }
            None => {
                // Cancelled earlier; drain silently.
            }
        }
    }
    debug!("dispatcher exiting");
}

fn worker_loop(request_rx: Receiver<Envelope>, response_tx: Sender<Response>) {
    backend::ensure_loaded_for_worker();
    let mut pool = ModelPool::new();
    let mut loras = LoraManager::new();
    info!("inference worker ready");

    while let Ok(Envelope { id, request }) = request_rx.recv() {
        run_request(&mut pool, &mut loras, &request, id, &response_tx);
    }

    pool.unload_all();
    info!("inference worker exiting");
}

/// One request, start to finish. Token events stream through `response_tx`;
/// the terminal event goes out the moment generation settles, before any
/// adapter, context, or pool teardown.
fn run_request(
    pool: &mut ModelPool,
    loras: &mut LoraManager,
    request: &InferenceRequest,
    id: u64,
    response_tx: &Sender<Response>,
) {
    // 1. Model, via the pool unless the caller shares a handle.
    let (model, pooled_path) = match &request.source {
        RequestSource::Path(path) => match pool.load(path, request.n_gpu_layers) {
            Ok(model) => (model, Some(path.clone())),
            Err(e) => {
                let _ = response_tx.send(Response {
                    id,
                    event: WorkerEvent::Failed(e),
                });
                return;
            }
        },
        RequestSource::Handle(model) => (Arc::clone(model), None),
    };

    run_with_model(loras, &model, request, id, response_tx);

    // 9 (tail). Release the model reference, after the terminal event.
    drop(model);
    if let Some(path) = pooled_path {
        pool.unload(&path, false);
    }
}

fn run_with_model(
    loras: &mut LoraManager,
    model: &Arc<Model>,
    request: &InferenceRequest,
    id: u64,
    response_tx: &Sender<Response>,
) {
    let send = |event: WorkerEvent| {
        let _ = response_tx.send(Response { id, event });
    };

    // 2. LoRA adapter, when requested.
    let adapter = match &request.lora {
        Some(lora) => match loras.load(model, &lora.path) {
            Ok(adapter) => Some((adapter, lora.scale, lora.path.clone())),
            Err(e) => {
                send(WorkerEvent::Failed(e));
                return;
            }
        },
        None => None,
    };

    // 3. Context with the requested sizing; adapter applied at scale.
    let mut ctx = match Context::new(
        Arc::clone(model),
        &ContextParams {
            n_ctx: request.n_ctx,
            n_batch: request.n_batch,
            n_threads: request.n_threads,
            embeddings: false,
        },
    ) {
        Ok(ctx) => ctx,
        Err(e) => {
            send(WorkerEvent::Failed(e));
            if let Some((_, _, path)) = &adapter {
                loras.unload(path, false);
            }
            return;
        }
    };
    if let Some((handle, scale, _)) = &adapter {
        if let Err(e) = loras.apply(&mut ctx, handle, *scale) {
            send(WorkerEvent::Failed(e));
            drop(ctx);
            if let Some((_, _, path)) = &adapter {
                loras.unload(path, false);
            }
            return;
        }
    }

    // 4–8. Prompt text (native template with the explicit family as
    // fallback), then tokenize, decode, and run the generation loop.
    let result = build_prompt(model, &request.input).and_then(|(prompt, mut stop_tokens)| {
        stop_tokens.extend(request.stop_tokens.iter().cloned());
        generate(model, &mut ctx, &prompt, &stop_tokens, &request.options, id, response_tx)
    });

    // 9. The sampler is freed inside `generate`; the completion response is
    // emitted next, then the adapter is cleared, the context freed, and the
    // adapter reference released.
    let event = match result {
        Ok((prompt_tokens, generated_tokens)) => WorkerEvent::Done {
            prompt_tokens,
            generated_tokens,
        },
        Err(e) => WorkerEvent::Failed(e),
    };
    send(event);

    ctx.clear_lora();
    drop(ctx);
    if let Some((_, _, path)) = &adapter {
        loras.unload(path, false);
    }
}

fn build_prompt(model: &Model, input: &PromptInput) -> Result<(String, Vec<String>)> {
    match input {
        PromptInput::Prompt(text) => Ok((text.clone(), Vec::new())),
        PromptInput::Messages(messages) => match model.apply_chat_template(messages, true) {
            Ok(prompt) => Ok((prompt, Vec::new())),
            Err(e) => {
                debug!("native template unavailable ({e}); falling back to explicit template");
                let template = model
                    .chat_template()
                    .as_deref()
                    .and_then(ChatTemplate::detect_from_template_text)
                    .unwrap_or_else(|| ChatTemplate::detect_from_path(model.path()));
                Ok((template.format(messages), template.stop_tokens()))
            }
        },
    }
}

fn generate(
    model: &Model,
    ctx: &mut Context,
    prompt: &str,
    stop_tokens: &[String],
    options: &GenerationOptions,
    id: u64,
    response_tx: &Sender<Response>,
) -> Result<(u32, u32)> {
    // 5. Tokenize; buffer sizing and retry live in the model wrapper.
    let tokens = model.tokenize(prompt, true, true)?;
    let prompt_tokens = tokens.len() as u32;
    debug!(id, prompt_tokens, "prompt tokenized");

    // 6. Single decode of the full prompt batch.
    let mut batch = Batch::new(tokens.len().max(1))?;
    batch.add_prompt(&tokens, 0)?;
    ctx.decode(&batch)?;

    // 7. Sampler chain in fixed order.
    let mut sampler = Sampler::from_options(options)?;

    // 8. Generation loop, bounded by max_tokens.
    let mut matcher = StopMatcher::new(stop_tokens);
    let mut generated: u32 = 0;
    let mut pos = tokens.len() as i32;

    for _ in 0..options.max_tokens {
        let token = sampler.sample(ctx, -1);
        sampler.accept(token);

        if model.is_eog(token) {
            debug!(id, generated, "end of generation token");
            break;
        }

        let piece = model.token_to_piece(token)?;
        match matcher.push(&piece) {
            StopScan::Emit(text) => {
                if !text.is_empty() {
                    let _ = response_tx.send(Response {
                        id,
                        event: WorkerEvent::Token(text),
                    });
                }
            }
            StopScan::Stop(text) => {
                if !text.is_empty() {
                    let _ = response_tx.send(Response {
                        id,
                        event: WorkerEvent::Token(text),
                    });
                }
                generated += 1;
                debug!(id, generated, "stop token hit");
                return Ok((prompt_tokens, generated));
            }
        }

        generated += 1;

        // Decode the accepted token to advance KV state.
        batch.clear();
        batch.add(token, pos, true)?;
        ctx.decode(&batch)?;
        pos += 1;
    }

    // Text held back as a possible stop prefix was no stop after all.
    let residual = matcher.finish();
    if !residual.is_empty() {
        let _ = response_tx.send(Response {
            id,
            event: WorkerEvent::Token(residual),
        });
    }

    Ok((prompt_tokens, generated))
}

/// What a stop scan decided for the window so far.
#[derive(Debug, PartialEq, Eq)]
enum StopScan {
    /// Emit this text (possibly empty while holding back a stop prefix).
    Emit(String),
    /// A stop token completed; emit this text and terminate.
    Stop(String),
}

/// Streaming stop-token detection with hold-back.
///
/// Stop markers can arrive split across token boundaries, so text that ends
/// with a prefix of any stop token is withheld until the next piece settles
/// whether the marker completes. Nothing past a completed marker is emitted.
struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

impl StopMatcher {
    fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            held: String::new(),
        }
    }

    fn push(&mut self, piece: &str) -> StopScan {
        if self.stops.is_empty() {
            return StopScan::Emit(piece.to_string());
        }

        let mut window = std::mem::take(&mut self.held);
        window.push_str(piece);

        if let Some(pos) = self
            .stops
            .iter()
            .filter_map(|stop| window.find(stop.as_str()))
            .min()
        {
            return StopScan::Stop(window[..pos].to_string());
        }

        let hold = self.longest_stop_prefix_suffix(&window);
        let emit_to = window.len() - hold;
        self.held = window.split_off(emit_to);
        StopScan::Emit(window)
    }

    /// Remaining held text once generation ends without a stop.
    fn finish(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    /// Longest suffix of `text` that is a proper prefix of some stop token.
    fn longest_stop_prefix_suffix(&self, text: &str) -> usize {
        let max_len = self
            .stops
            .iter()
            .map(|s| s.len().saturating_sub(1))
            .max()
            .unwrap_or(0)
            .min(text.len());
        for len in (1..=max_len).rev() {
            if !text.is_char_boundary(text.len() - len) {
                continue;
            }
            let suffix = &text[text.len() - len..];
            if self.stops.iter().any(|s| s.len() > len && s.starts_with(suffix)) {
                return len;
            }
        }
        0
    }
}

/// Options for an embedding batch.
#[derive(Debug, Clone)]
pub struct EmbedParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    pub n_threads: Option<i32>,
    /// L2-normalize each vector. On by default.
    pub normalize: bool,
}

impl Default for EmbedParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_gpu_layers: 0,
            n_threads: None,
            normalize: true,
        }
    }
}

/// Compute embeddings for a text batch on a short-lived worker of its own:
/// per text, clear the KV cache, decode, read the sequence embedding,
/// normalize. Runs blocking; call from a blocking task.
pub fn run_embedding_batch(
    model_path: &Path,
    texts: &[String],
    params: &EmbedParams,
) -> Result<Vec<Embedding>> {
    backend::ensure_loaded_for_worker();
    let model = Arc::new(Model::load(model_path, params.n_gpu_layers)?);
    let mut ctx = Context::new(
        Arc::clone(&model),
        &ContextParams {
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            n_threads: params.n_threads,
            embeddings: true,
        },
    )?;

    let mut embeddings = Vec::with_capacity(texts.len());
    for (index, text) in texts.iter().enumerate() {
        ctx.kv_clear();
        let tokens = model.tokenize(text, true, true)?;
        let mut batch = Batch::new(tokens.len().max(1))?;
        for (i, &token) in tokens.iter().enumerate() {
            batch.add(token, i as i32, true)?;
        }
        ctx.decode(&batch)?;

        let raw = ctx.embeddings_seq(0)?;
        let mut values: Vec<f64> = raw.iter().map(|&v| f64::from(v)).collect();
        if params.normalize {
            l2_normalize(&mut values);
        }
        embeddings.push(Embedding { index, values });
    }
    Ok(embeddings)
}

fn l2_normalize(values: &mut [f64]) {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
