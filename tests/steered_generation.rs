// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: end-to-end steered generation on a tiny randomly
//! initialised transformer with a byte-level tokenizer.
//!
//! Run:
//!   `cargo test --test steered_generation`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_steer::{
    CausalLm, ChatRenderer, ChatState, ChipOptions, DraftModel, ForwardOptions, GenerationParams,
    GenerationSession, GenericTransformer, KVCache, PromptBatch, SteerError, SteeringCapable,
    SteeringConfiguration, SteeringRequest, SteeringSettings, TextTokenizer, TransformerConfig,
    prepare,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const EOS: u32 = 256;
const PAD: u32 = 257;
const VOCAB: usize = 260;

/// One id per byte, plus EOS and PAD.
struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str, _add_bos: bool, _special: bool) -> candle_steer::Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> candle_steer::Result<String> {
        // Latin-1, so every id decodes to a complete character.
        Ok(ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .map(char::from)
            .collect())
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS)
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(PAD)
    }
}

/// Delegates to a transformer but does not advertise steering support.
struct Unsteerable(GenericTransformer);

impl CausalLm for Unsteerable {
    fn num_layers(&self) -> usize {
        self.0.num_layers()
    }

    fn vocab_size(&self) -> usize {
        self.0.vocab_size()
    }

    fn device(&self) -> &Device {
        self.0.device()
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> candle_steer::Result<Tensor> {
        self.0.forward(input_ids, cache, options)
    }
}

/// Steerable model whose forward pass fails once `limit` calls succeeded.
struct FailingAfter {
    model: GenericTransformer,
    limit: usize,
    calls: AtomicUsize,
}

impl CausalLm for FailingAfter {
    fn num_layers(&self) -> usize {
        self.model.num_layers()
    }

    fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    fn device(&self) -> &Device {
        self.model.device()
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        cache: &mut KVCache,
        options: &ForwardOptions<'_>,
    ) -> candle_steer::Result<Tensor> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(SteerError::Generation("device lost".into()));
        }
        self.model.forward(input_ids, cache, options)
    }

    fn as_steering_capable(&self) -> Option<&dyn SteeringCapable> {
        Some(self)
    }
}

impl SteeringCapable for FailingAfter {
    fn attention_layers(&self) -> Vec<usize> {
        self.model.attention_layers()
    }
}

fn tiny_config() -> TransformerConfig {
    let json = serde_json::json!({
        "model_type": "llama",
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "intermediate_size": 32,
        "vocab_size": VOCAB,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "max_position_embeddings": 1024
    });
    TransformerConfig::from_hf_config(&json).unwrap()
}

fn tiny_model() -> (GenericTransformer, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = GenericTransformer::load(tiny_config(), &Device::Cpu, DType::F32, vb).unwrap();
    (model, varmap)
}

fn session() -> (GenerationSession, VarMap) {
    let (model, varmap) = tiny_model();
    (
        GenerationSession::new(Arc::new(model), Arc::new(ByteTokenizer)),
        varmap,
    )
}

fn params(max_new_tokens: usize) -> GenerationParams {
    let mut params = GenerationParams::greedy();
    params.max_new_tokens = max_new_tokens;
    params.ban_eos_token = true;
    params.add_bos_token = false;
    params
}

/// Positive and negative texts of equal byte length.
fn steered_state() -> ChatState {
    ChatState {
        context: "[[POSITIVE]]\nBe happy.\n[[NEGATIVE]]\nBe angry.\n".into(),
        ..ChatState::default()
    }
}

fn enabled() -> ChipOptions {
    ChipOptions {
        enabled: true,
        ..ChipOptions::default()
    }
}

/// Route log output through the test harness.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Drain a stream and return (row-0 tokens, per-row appended tokens).
fn run(session: &mut GenerationSession, prompt: &str, params: &GenerationParams) -> (Vec<u32>, Vec<Vec<u32>>) {
    let mut stream = session.generate(prompt, params).unwrap();
    for chunk in stream.by_ref() {
        chunk.unwrap();
    }
    (stream.tokens().to_vec(), stream.row_tokens().to_vec())
}

// ---------------------------------------------------------------------------
// Batch lifecycle
// ---------------------------------------------------------------------------

#[test]
fn every_row_receives_the_sampled_token() {
    let (mut session, _vm) = session();
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.5}]}"#).unwrap();
    let params = params(5);
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(enabled());

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    assert!(session.is_steering_attached());
    assert_eq!(session.cache_batch_size(), 2);

    let (tokens, rows) = run(&mut session, &prompt, &params);
    assert_eq!(tokens.len(), 5);
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row, &tokens);
    }
    assert!(!session.is_steering_attached());
}

#[test]
fn zero_weight_matches_plain_generation() {
    let (mut session, _vm) = session();
    let state = steered_state();
    let settings = SteeringSettings::from_json(
        r#"{"residual": [{"weight": 0.0}], "attention": [{"site": "v", "weight": 0.0}]}"#,
    )
    .unwrap();
    let params = params(6);
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(enabled());

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    let (steered, _) = run(&mut session, &prompt, &params);

    let (plain, rows) = run(&mut session, &prompt, &params);
    assert_eq!(rows.len(), 1);
    assert_eq!(session.cache_batch_size(), 1);
    assert_eq!(steered, plain);
}

#[test]
fn sampled_other_prompts_are_reported() {
    init_tracing();
    let (mut session, _vm) = session();
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.3}]}"#).unwrap();
    let params = params(4);
    let options = ChipOptions {
        enabled: true,
        output_prompts: true,
        sample_other_prompts: true,
    };
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(options);

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    run(&mut session, &prompt, &params);

    let outputs = session.other_prompt_outputs().unwrap();
    assert!(outputs.positive.is_empty());
    assert_eq!(outputs.negative.len(), 1);
    assert_eq!(outputs.negative[0].0, 1);
}

#[test]
fn disabled_request_uses_single_row() {
    let (mut session, _vm) = session();
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.3}]}"#).unwrap();
    let params = params(2);
    let request = SteeringRequest::new("Hi", &state, &settings);

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    assert!(!session.is_steering_attached());
    assert!(prompt.contains("[[NEGATIVE]]"));
    let (_, rows) = run(&mut session, &prompt, &params);
    assert_eq!(rows.len(), 1);
}

#[test]
fn detach_twice_is_harmless() {
    let (mut session, _vm) = session();
    let state = steered_state();
    let settings = SteeringSettings::default();
    let params = params(2);
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(enabled());

    prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    assert!(session.is_steering_attached());
    session.detach();
    session.detach();
    assert!(!session.is_steering_attached());
}

#[test]
fn attach_rejects_mismatched_layer_count() {
    let (mut session, _vm) = session();
    let config = SteeringConfiguration::new(5, Vec::new());
    let err = session.attach(PromptBatch::single("x"), config, false);
    assert!(err.is_err());
    assert!(!session.is_steering_attached());
}

// ---------------------------------------------------------------------------
// Fallbacks
// ---------------------------------------------------------------------------

#[test]
fn unsteerable_model_falls_back_to_plain_prompt() {
    let (model, _vm) = tiny_model();
    let mut session = GenerationSession::new(Arc::new(Unsteerable(model)), Arc::new(ByteTokenizer));
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.3}]}"#).unwrap();
    let params = params(2);
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(enabled());

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    assert!(!session.is_steering_attached());
    assert_eq!(session.cache_batch_size(), 1);
    assert!(prompt.contains("[[POSITIVE]]"));

    let config = SteeringConfiguration::new(2, vec![0, 1]);
    assert!(session.attach(PromptBatch::single("x"), config, false).is_err());
}

#[test]
fn draft_model_disables_steering() {
    let (model, _vm) = tiny_model();
    let model: Arc<dyn CausalLm> = Arc::new(model);
    let draft = DraftModel::new(Arc::clone(&model), 3).unwrap();
    let mut session = GenerationSession::new(model, Arc::new(ByteTokenizer)).with_draft(draft);
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.3}]}"#).unwrap();
    let params = params(2);
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(enabled());

    prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    assert!(!session.is_steering_attached());
}

// ---------------------------------------------------------------------------
// Decoding paths
// ---------------------------------------------------------------------------

#[test]
fn speculative_decoding_matches_greedy() {
    let (model, _vm) = tiny_model();
    let model: Arc<dyn CausalLm> = Arc::new(model);
    let params = params(8);

    let mut plain = GenerationSession::new(Arc::clone(&model), Arc::new(ByteTokenizer));
    let (expected, _) = run(&mut plain, "Once upon a time", &params);

    let draft = DraftModel::new(Arc::clone(&model), 3).unwrap();
    let mut speculative =
        GenerationSession::new(Arc::clone(&model), Arc::new(ByteTokenizer)).with_draft(draft);
    let (actual, _) = run(&mut speculative, "Once upon a time", &params);

    assert_eq!(actual.len(), 8);
    assert_eq!(actual, expected);
}

#[test]
fn stop_signal_ends_the_stream() {
    let (mut session, _vm) = session();
    let signal = session.stop_signal();
    let params = params(50);

    let mut stream = session.generate("Hello there", &params).unwrap();
    stream.next().unwrap().unwrap();
    let produced = stream.tokens().len();
    signal.stop();
    for chunk in stream.by_ref() {
        chunk.unwrap();
    }
    assert_eq!(stream.tokens().len(), produced);
    assert!(produced < 50);
}

#[test]
fn token_budget_is_respected() {
    let (mut session, _vm) = session();
    let text = session.generate_text("abc", &params(3)).unwrap();
    assert!(text.len() <= 3 * 3);
    let (tokens, _) = run(&mut session, "abc", &params(3));
    assert_eq!(tokens.len(), 3);
}

#[test]
fn stop_raised_before_generate_cancels_the_request() {
    let (mut session, _vm) = session();
    let signal = session.stop_signal();
    let params = params(5);

    signal.stop();
    let (tokens, _) = run(&mut session, "Hello", &params);
    assert!(tokens.is_empty());
    assert!(!signal.is_stopped());

    let (tokens, _) = run(&mut session, "Hello", &params);
    assert_eq!(tokens.len(), 5);
}

#[test]
fn stop_during_steered_request_keeps_diagnostics() {
    let (mut session, _vm) = session();
    let signal = session.stop_signal();
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.3}]}"#).unwrap();
    // Keep every sampled id inside the byte range so each decodes to one char.
    let mut params = params(50);
    params.custom_token_bans = "257,258,259".into();
    let options = ChipOptions {
        enabled: true,
        sample_other_prompts: true,
        ..ChipOptions::default()
    };
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(options);

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    {
        let mut stream = session.generate(&prompt, &params).unwrap();
        stream.next().unwrap().unwrap();
        stream.next().unwrap().unwrap();
        assert_eq!(stream.tokens().len(), 2);
        signal.stop();
        for chunk in stream.by_ref() {
            chunk.unwrap();
        }
        assert_eq!(stream.tokens().len(), 2);
    }

    assert!(!session.is_steering_attached());
    let outputs = session.other_prompt_outputs().unwrap();
    assert_eq!(outputs.negative.len(), 1);
    let (row, text) = &outputs.negative[0];
    assert_eq!(*row, 1);
    assert_eq!(text.chars().count(), 2);
}

#[test]
fn forward_failure_detaches_and_reports_once() {
    let (model, _vm) = tiny_model();
    let failing = FailingAfter {
        model,
        // prefill and one decode step succeed
        limit: 2,
        calls: AtomicUsize::new(0),
    };
    let mut session = GenerationSession::new(Arc::new(failing), Arc::new(ByteTokenizer));
    let state = steered_state();
    let settings = SteeringSettings::from_json(r#"{"residual": [{"weight": 0.3}]}"#).unwrap();
    let params = params(10);
    let options = ChipOptions {
        enabled: true,
        sample_other_prompts: true,
        ..ChipOptions::default()
    };
    let request = SteeringRequest::new("Hi", &state, &settings).with_options(options);

    let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params).unwrap();
    assert!(session.is_steering_attached());

    let items: Vec<_> = session.generate(&prompt, &params).unwrap().collect();
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(SteerError::Generation(_))));
    assert!(!session.is_steering_attached());
}
