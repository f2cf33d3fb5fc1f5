// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batched generation that samples only the primary row.
//!
//! Every row of a steering batch runs through the model in lock-step, but
//! only row 0 chooses the next token. That token is replayed into every
//! row, so the rows differ only in the steering contributions they make to
//! each other's activations.

pub mod params;
pub mod sampler;
pub mod session;
pub mod speculative;
pub mod stream;

pub use params::GenerationParams;
pub use sampler::{LogitsSampler, SampledToken, TokenSampler};
pub use session::{GenerationSession, OtherPromptOutputs, StopSignal};
pub use speculative::DraftModel;
pub use stream::TextStream;
