// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request preparation: from chat state to a session ready to generate.
//!
//! [`prepare`] decides between the steered path (a prompt batch attached to
//! the session) and the plain single-prompt path, and returns the prompt to
//! pass to [`GenerationSession::generate`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle_steer::{
//!     ChatRenderer, ChatState, ChipOptions, GenerationParams, GenerationSession,
//!     HfTokenizer, SteeringRequest, SteeringSettings, backend, prepare,
//! };
//!
//! # fn main() -> candle_steer::Result<()> {
//! let device = backend::select_device()?;
//! let dir = std::path::Path::new("models/tiny-llama");
//! let model = backend::load_from_dir(dir, &device, backend::default_dtype(&device))?;
//! let tokenizer = HfTokenizer::from_file(dir.join("tokenizer.json"))?;
//! let mut session = GenerationSession::new(Arc::new(model), Arc::new(tokenizer));
//!
//! let state = ChatState {
//!     context: "[[POSITIVE]]\nBe cheerful.\n[[NEGATIVE]]\nBe gloomy.\n".into(),
//!     ..ChatState::default()
//! };
//! let settings = SteeringSettings::from_json(r#"{"residual": [{"layers": "all", "weight": 0.4}]}"#)?;
//! let params = GenerationParams::default();
//! let request = SteeringRequest::new("How is the weather?", &state, &settings)
//!     .with_options(ChipOptions { enabled: true, ..ChipOptions::default() });
//! let prompt = prepare(&mut session, &ChatRenderer::chatml(&state), &request, &params)?;
//! for chunk in session.generate(&prompt, &params)? {
//!     print!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```

use serde::Deserialize;

use crate::error::Result;
use crate::generation::{GenerationParams, GenerationSession};
use crate::prompt::{self, ChatRenderer, ChatState, RenderOptions};
use crate::steering::SteeringSettings;

/// Per-request steering switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChipOptions {
    /// Build and attach a prompt batch.
    pub enabled: bool,
    /// Log every rendered prompt of the batch.
    pub output_prompts: bool,
    /// Sample every extra row on its own and report the continuations.
    pub sample_other_prompts: bool,
}

/// Inputs of one steered request.
#[derive(Debug, Clone, Copy)]
pub struct SteeringRequest<'a> {
    /// Text the user typed.
    pub user_input: &'a str,
    /// Conversation state, with annotated context and system message.
    pub state: &'a ChatState,
    /// Steering weights per layer and site.
    pub settings: &'a SteeringSettings,
    /// Steering switches.
    pub options: ChipOptions,
    /// `continue` / `impersonate` flags for rendering.
    pub render: RenderOptions,
}

impl<'a> SteeringRequest<'a> {
    /// Request with default switches (steering disabled).
    #[must_use]
    pub fn new(user_input: &'a str, state: &'a ChatState, settings: &'a SteeringSettings) -> Self {
        Self {
            user_input,
            state,
            settings,
            options: ChipOptions::default(),
            render: RenderOptions::default(),
        }
    }

    /// Set the steering switches.
    #[must_use]
    pub const fn with_options(mut self, options: ChipOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the rendering flags.
    #[must_use]
    pub const fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }
}

/// Prepare `session` for `request` and return the prompt to generate from.
///
/// With steering enabled on a steering-capable model and no draft model,
/// the prompt batch is built, attached with the resolved rule table, and
/// its row 0 returned. Otherwise the plain rendered prompt is returned and
/// nothing is attached; an unsupported setup is reported once per session.
///
/// # Errors
///
/// Propagates rendering, settings-resolution and attachment errors.
pub fn prepare(
    session: &mut GenerationSession,
    renderer: &ChatRenderer,
    request: &SteeringRequest<'_>,
    params: &GenerationParams,
) -> Result<String> {
    session.detach();

    let max_tokens = params.max_prompt_length();
    let tokenizer = session.tokenizer();
    let count_tokens = |text: &str| -> Result<usize> {
        Ok(tokenizer
            .encode(text, params.add_bos_token, params.encode_special_tokens)?
            .len())
    };
    let render = |input: &str, state: &ChatState| {
        renderer.render(input, state, request.render, max_tokens, &count_tokens)
    };

    if !request.options.enabled {
        return render(request.user_input, request.state);
    }

    let fallback = match session.model().as_steering_capable() {
        None => Some("model does not support steering"),
        Some(_) if session.has_draft() => Some("speculative decoding is enabled"),
        Some(_) => None,
    };
    if let Some(reason) = fallback {
        let plain = render(request.user_input, request.state)?;
        session.report_fallback(reason);
        return Ok(plain);
    }

    let (batch, config) = {
        let model = session.model();
        let attention_layers = model
            .as_steering_capable()
            .map(|capable| capable.attention_layers())
            .unwrap_or_default();
        let config = request
            .settings
            .resolve(model.num_layers(), &attention_layers)?;
        let (batch, _base_state) = prompt::build(request.user_input, request.state, render)?;
        (batch, config)
    };

    if request.options.output_prompts {
        for (row, (label, text)) in batch.labels().iter().zip(batch.prompts()).enumerate() {
            let role = if row < batch.numpos() { "positive" } else { "negative" };
            tracing::info!(row, role, label = %label, prompt = %text, "steering prompt");
        }
    }

    let base = batch.base_prompt().to_owned();
    session.attach(batch, config, request.options.sample_other_prompts)?;
    Ok(base)
}
