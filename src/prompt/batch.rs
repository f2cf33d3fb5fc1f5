// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt batch construction.
//!
//! Both the character context and the custom system message are parsed for
//! steering regions. Extras with the same name are paired across the two
//! channels; an extra present in only one channel inherits the other
//! channel's base text of the same polarity. The batch is ordered:
//!
//! ```text
//! [0]                base positive   (the generated stream)
//! [1, numpos)        positive extras
//! [numpos, ..)       negative extras
//! [negend - 1]       aggregate negative (when any negative text exists)
//! ```

use crate::error::{Result, SteerError};
use crate::steering::BatchLayout;

use super::chat::{ChatState, strip_chat_markers};
use super::context::{self, NEGATIVE, POSITIVE, ParsedRegions};

// ---------------------------------------------------------------------------
// PromptBatch
// ---------------------------------------------------------------------------

/// Rendered prompt variants plus their row layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBatch {
    /// One rendered prompt per row.
    prompts: Vec<String>,
    /// Region name each row was built from (`POSITIVE`, `NEGATIVE-RUDE`, ...).
    labels: Vec<String>,
    /// Row counts.
    layout: BatchLayout,
}

impl PromptBatch {
    /// Batch holding a single plain prompt.
    #[must_use]
    pub fn single(prompt: impl Into<String>) -> Self {
        Self {
            prompts: vec![prompt.into()],
            labels: vec![POSITIVE.to_owned()],
            layout: BatchLayout::single(),
        }
    }

    /// All prompts in row order.
    #[must_use]
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Region label of each row.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Row 0, the prompt whose continuation is returned.
    #[must_use]
    pub fn base_prompt(&self) -> &str {
        self.prompts.first().map_or("", String::as_str)
    }

    /// Row layout.
    #[must_use]
    pub const fn layout(&self) -> BatchLayout {
        self.layout
    }

    /// Number of positive rows.
    #[must_use]
    pub const fn numpos(&self) -> usize {
        self.layout.numpos
    }

    /// Number of negative rows.
    #[must_use]
    pub const fn numneg(&self) -> usize {
        self.layout.numneg
    }

    /// `numpos + numneg`.
    #[must_use]
    pub const fn negend(&self) -> usize {
        self.layout.negend()
    }

    /// Number of rows.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.prompts.len()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Context and system-message text for one extra.
#[derive(Debug, Clone)]
struct ExtraTexts {
    /// Character context.
    context: String,
    /// System message.
    instruction: String,
}

/// Build the prompt batch for one request.
///
/// `render(user_input, state)` renders one variant; it receives a copy of
/// `state` whose `context` and `custom_system_message` hold that variant's
/// texts. Returns the batch and the state carrying the base positive texts.
///
/// # Errors
///
/// Propagates errors from `render`.
pub fn build<F>(user_input: &str, state: &ChatState, mut render: F) -> Result<(PromptBatch, ChatState)>
where
    F: FnMut(&str, &ChatState) -> Result<String>,
{
    let ctx = context::parse(&state.context);
    let inst = context::parse(&state.custom_system_message);

    let negative_instruction = if !ctx.negative.is_empty() && inst.negative.is_empty() {
        inst.positive.clone()
    } else {
        inst.negative.clone()
    };

    let positive_extras = pair_extras(
        &ctx,
        &inst,
        |p| &p.positive_extras,
        &ctx.positive,
        &inst.positive,
    );
    let negative_extras = pair_extras(
        &ctx,
        &inst,
        |p| &p.negative_extras,
        &ctx.negative,
        &negative_instruction,
    );

    let mut variant = state.clone();
    let mut render_with = |context: &str, instruction: &str| -> Result<String> {
        variant.context = context.to_owned();
        variant.custom_system_message = instruction.to_owned();
        Ok(strip_chat_markers(&render(user_input, &variant)?))
    };

    let mut prompts = vec![render_with(&ctx.positive, &inst.positive)?];
    let mut labels = vec![POSITIVE.to_owned()];
    let mut numpos = 1;
    let mut numneg = 0;

    for (name, texts) in &positive_extras {
        prompts.push(render_with(&texts.context, &texts.instruction)?);
        labels.push(name.clone());
        numpos += 1;
    }
    for (name, texts) in &negative_extras {
        prompts.push(render_with(&texts.context, &texts.instruction)?);
        labels.push(name.clone());
        numneg += 1;
    }
    if !ctx.negative.is_empty() || !negative_instruction.is_empty() {
        prompts.push(render_with(&ctx.negative, &negative_instruction)?);
        labels.push(NEGATIVE.to_owned());
        numneg += 1;
    }

    let layout = BatchLayout::new(numpos, numneg)?;
    if prompts.len() != layout.batch_size() {
        return Err(SteerError::Steering(format!(
            "built {} prompts for a batch of {}",
            prompts.len(),
            layout.batch_size()
        )));
    }

    let mut base_state = state.clone();
    base_state.context = ctx.positive;
    base_state.custom_system_message = inst.positive;

    Ok((
        PromptBatch {
            prompts,
            labels,
            layout,
        },
        base_state,
    ))
}

/// Pair same-named extras across the context and system-message channels.
///
/// Context extras come first in declaration order, then instruction-only
/// extras. A missing side falls back to that channel's base text.
fn pair_extras(
    ctx: &ParsedRegions,
    inst: &ParsedRegions,
    extras: impl Fn(&ParsedRegions) -> &context::RegionMap,
    base_context: &str,
    base_instruction: &str,
) -> Vec<(String, ExtraTexts)> {
    let mut paired: Vec<(String, ExtraTexts)> = extras(ctx)
        .iter()
        .map(|(name, text)| {
            (
                name.to_owned(),
                ExtraTexts {
                    context: text.to_owned(),
                    instruction: base_instruction.to_owned(),
                },
            )
        })
        .collect();

    for (name, text) in extras(inst).iter() {
        match paired.iter_mut().find(|(n, _)| n == name) {
            Some((_, texts)) => texts.instruction = text.to_owned(),
            None => paired.push((
                name.to_owned(),
                ExtraTexts {
                    context: base_context.to_owned(),
                    instruction: text.to_owned(),
                },
            )),
        }
    }
    paired
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Render as `system|context|input` so tests can see which texts were used.
    fn echo(input: &str, state: &ChatState) -> Result<String> {
        Ok(format!("{}|{}|{input}", state.custom_system_message, state.context))
    }

    fn state(context: &str, system: &str) -> ChatState {
        ChatState {
            context: context.into(),
            custom_system_message: system.into(),
            ..ChatState::default()
        }
    }

    fn assert_invariants(batch: &PromptBatch) {
        assert_eq!(batch.prompts().len(), batch.negend());
        assert_eq!(batch.negend(), batch.numpos() + batch.numneg());
        assert!(batch.numpos() >= 1);
        assert_eq!(batch.labels()[0], POSITIVE);
    }

    #[test]
    fn plain_context_is_single_row() {
        let (batch, base) = build("hi", &state("You are Bob.", "sys"), echo).unwrap();
        assert_invariants(&batch);
        assert_eq!(batch.batch_size(), 1);
        assert_eq!(batch.numneg(), 0);
        assert_eq!(batch.base_prompt(), "sys|You are Bob.|hi");
        assert_eq!(base.context, "You are Bob.");
    }

    #[test]
    fn shared_positive_negative_and_extra() {
        let context = "[[SHARED]]\nBe terse.\n[[POSITIVE]]\n{{SHARED}} Be happy.\n\
                       [[NEGATIVE]]\n{{SHARED}} Be sad.\n[[POSITIVE-FORMAL]]\nBe formal.";
        let (batch, base) = build("q", &state(context, "sys"), echo).unwrap();
        assert_invariants(&batch);
        assert_eq!(batch.numpos(), 2);
        assert_eq!(batch.numneg(), 1);
        assert_eq!(
            batch.prompts(),
            [
                "sys|Be terse.\n Be happy.\n|q",
                "sys|Be formal.|q",
                "sys|Be terse.\n Be sad.\n|q",
            ]
        );
        assert_eq!(batch.labels(), ["POSITIVE", "POSITIVE-FORMAL", "NEGATIVE"]);
        assert_eq!(base.context, "Be terse.\n Be happy.\n");
    }

    #[test]
    fn negative_instruction_falls_back_to_positive() {
        let (batch, _) = build("q", &state("[[POSITIVE]]\nup\n[[NEGATIVE]]\ndown\n", "sys"), echo)
            .unwrap();
        assert_eq!(batch.prompts()[1], "sys|down\n|q");
    }

    #[test]
    fn negative_only_in_system_message() {
        let (batch, _) = build(
            "q",
            &state("ctx", "[[POSITIVE]]\nkind\n[[NEGATIVE]]\ncruel\n"),
            echo,
        )
        .unwrap();
        assert_invariants(&batch);
        assert_eq!(batch.prompts(), ["kind\n|ctx|q", "cruel\n||q"]);
    }

    #[test]
    fn extras_pair_across_channels() {
        let context = "[[POSITIVE]]\np\n[[POSITIVE-A]]\nctx-a\n[[NEGATIVE]]\nn\n[[NEGATIVE-X]]\nctx-x\n";
        let system = "[[POSITIVE]]\nsp\n[[POSITIVE-A]]\ninst-a\n[[POSITIVE-B]]\ninst-b\n\
                      [[NEGATIVE]]\nsn\n";
        let (batch, _) = build("q", &state(context, system), echo).unwrap();
        assert_invariants(&batch);
        assert_eq!(batch.numpos(), 3);
        assert_eq!(batch.numneg(), 2);
        assert_eq!(
            batch.prompts(),
            [
                "sp\n|p\n|q",
                "inst-a\n|ctx-a\n|q",
                "inst-b\n|p\n|q",
                "sn\n|ctx-x\n|q",
                "sn\n|n\n|q",
            ]
        );
        assert_eq!(
            batch.labels(),
            ["POSITIVE", "POSITIVE-A", "POSITIVE-B", "NEGATIVE-X", "NEGATIVE"]
        );
    }

    #[test]
    fn chat_markers_removed_from_every_row() {
        let marked = |input: &str, s: &ChatState| -> Result<String> {
            Ok(format!("<|nochat|>{}<|chat|>{input}", s.context))
        };
        let (batch, _) = build("q", &state("[[POSITIVE]]\na\n[[NEGATIVE]]\nb\n", ""), marked)
            .unwrap();
        assert_eq!(batch.prompts(), ["a\nq", "b\nq"]);
    }

    #[test]
    fn render_errors_propagate() {
        let failing = |_: &str, _: &ChatState| -> Result<String> {
            Err(SteerError::Template("boom".into()))
        };
        assert!(build("q", &state("x", ""), failing).is_err());
    }
}
