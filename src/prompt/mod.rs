// SPDX-License-Identifier: MIT OR Apache-2.0

//! From annotated context to a batch of rendered prompt variants.
//!
//! - [`context`]: `[[NAME]]` region parsing and `{{NAME}}` substitution.
//! - [`chat`]: chat / instruct / chat-instruct rendering.
//! - [`batch`]: pairs regions across channels and renders every variant.

pub mod batch;
pub mod chat;
pub mod context;

pub use batch::{PromptBatch, build};
pub use chat::{
    ChatMessage, ChatMlTemplate, ChatMode, ChatRenderer, ChatState, ChatTemplate,
    NamedChatTemplate, RenderOptions, Role,
};
pub use context::{ParsedRegions, RegionMap, parse};
