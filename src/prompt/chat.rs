// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat rendering: turns a conversation state into one text prompt.
//!
//! Three modes are supported:
//!
//! - **chat**: the character context becomes the system message and the
//!   chat template renders the dialogue, followed by the bot prefix.
//! - **instruct**: the custom system message is used instead and the
//!   instruction template renders the dialogue.
//! - **chat-instruct**: the dialogue is first rendered with the chat
//!   template, then embedded into the chat-instruct command
//!   (`<|character|>`, `<|prompt|>`) and wrapped by the instruction
//!   template. A user input containing `<|nochat|>` skips the wrapping
//!   command and bot prefix.
//!
//! When the rendered prompt exceeds the token budget, the oldest
//! non-system message is dropped until it fits.

use serde::Deserialize;

use crate::error::{Result, SteerError};

/// Marker that disables chat-instruct wrapping for one turn.
pub const NOCHAT_MARKER: &str = "<|nochat|>";
/// Counterpart marker, stripped alongside [`NOCHAT_MARKER`].
pub const CHAT_MARKER: &str = "<|chat|>";

/// History entries with this user text are not rendered.
const BEGIN_VISIBLE_CHAT: &str = "<|BEGIN-VISIBLE-CHAT|>";

/// Placeholders used to discover a template's generation prefix and suffix.
const MARKER_1: &str = "<<|user-message-1|>>";
const MARKER_2: &str = "<<|user-message-2|>>";

// ---------------------------------------------------------------------------
// Messages and state
// ---------------------------------------------------------------------------

/// Author of a chat message.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System / context message.
    System,
    /// The human side.
    User,
    /// The model side.
    Assistant,
}

impl Role {
    /// Lower-case role name as used by chat templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
}

impl ChatMessage {
    /// Create a message.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Prompting mode.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ChatMode {
    /// Character chat.
    #[default]
    #[serde(rename = "chat")]
    Chat,
    /// Plain instruction following.
    #[serde(rename = "instruct")]
    Instruct,
    /// Chat wrapped in an instruction.
    #[serde(rename = "chat-instruct")]
    ChatInstruct,
}

/// Conversation state consumed by the renderer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatState {
    /// Prompting mode.
    pub mode: ChatMode,
    /// Past `(user, assistant)` turns, oldest first.
    pub history: Vec<(String, String)>,
    /// Character context (may carry steering regions).
    pub context: String,
    /// Instruction-mode system message (may carry steering regions).
    pub custom_system_message: String,
    /// User display name.
    pub name1: String,
    /// Character display name.
    pub name2: String,
    /// Chat-instruct wrapper with `<|character|>` and `<|prompt|>` slots.
    pub chat_instruct_command: String,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            mode: ChatMode::Chat,
            history: Vec::new(),
            context: String::new(),
            custom_system_message: String::new(),
            name1: "You".into(),
            name2: "Assistant".into(),
            chat_instruct_command: "Continue the chat dialogue below. Write a single reply for \
                                    the character \"<|character|>\".\n\n<|prompt|>"
                .into(),
        }
    }
}

/// Per-call rendering flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Generate the user's next message instead of the character's.
    pub impersonate: bool,
    /// Continue the last assistant message instead of starting a new one.
    pub continue_reply: bool,
}

// ---------------------------------------------------------------------------
// ChatTemplate
// ---------------------------------------------------------------------------

/// A chat template: renders a message list to text.
pub trait ChatTemplate: Send + Sync {
    /// Render `messages`, optionally followed by the assistant turn opener.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Template`] if the template cannot render.
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String>;
}

/// `ChatML` (`<|im_start|>role\n...<|im_end|>\n`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatMlTemplate;

impl ChatTemplate for ChatMlTemplate {
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let mut out = String::new();
        for m in messages {
            out.push_str("<|im_start|>");
            out.push_str(m.role.as_str());
            out.push('\n');
            out.push_str(&m.content);
            out.push_str("<|im_end|>\n");
        }
        if add_generation_prompt {
            out.push_str("<|im_start|>assistant\n");
        }
        Ok(out)
    }
}

/// Transcript-style chat template: `Name: text` lines.
#[derive(Debug, Clone)]
pub struct NamedChatTemplate {
    /// Prefix for user lines.
    name1: String,
    /// Prefix for assistant lines.
    name2: String,
}

impl NamedChatTemplate {
    /// Template with the given user and character names.
    #[must_use]
    pub fn new(name1: impl Into<String>, name2: impl Into<String>) -> Self {
        Self {
            name1: name1.into(),
            name2: name2.into(),
        }
    }
}

impl ChatTemplate for NamedChatTemplate {
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let mut out = String::new();
        for m in messages {
            match m.role {
                Role::System => {}
                Role::User => {
                    out.push_str(&self.name1);
                    out.push_str(": ");
                }
                Role::Assistant => {
                    out.push_str(&self.name2);
                    out.push_str(": ");
                }
            }
            out.push_str(&m.content);
            out.push('\n');
        }
        if add_generation_prompt {
            out.push_str(&self.name2);
            out.push(':');
        }
        Ok(out)
    }
}

/// Discover the text a template puts before (`prefix`) and after
/// (`suffix`) a message of the generated role.
///
/// Renders two marker messages and slices between them. With `impersonate`
/// the generated role is the user.
///
/// # Errors
///
/// Returns [`SteerError::Template`] if the markers do not survive rendering.
pub fn generation_prefix(
    template: &dyn ChatTemplate,
    impersonate: bool,
    strip_trailing_spaces: bool,
) -> Result<(String, String)> {
    let role = if impersonate {
        Role::User
    } else {
        Role::Assistant
    };
    let markers = [ChatMessage::new(role, MARKER_1), ChatMessage::new(role, MARKER_2)];
    let rendered = template.render(&markers, false)?;

    let missing = || SteerError::Template("template dropped the marker messages".into());
    let (_, after_first) = rendered.split_once(MARKER_1).ok_or_else(missing)?;
    let (between, suffix) = after_first.split_once(MARKER_2).ok_or_else(missing)?;
    let prefix = between.strip_prefix(suffix).unwrap_or(between);
    let prefix = if strip_trailing_spaces {
        prefix.trim_end_matches(' ')
    } else {
        prefix
    };
    Ok((prefix.to_owned(), suffix.to_owned()))
}

// ---------------------------------------------------------------------------
// ChatRenderer
// ---------------------------------------------------------------------------

/// Renders a [`ChatState`] plus user input into a prompt.
pub struct ChatRenderer {
    /// Template for chat mode (and the inner prompt of chat-instruct).
    // TRAIT_OBJECT: templates are chosen at run time
    chat: Box<dyn ChatTemplate>,
    /// Template for instruct mode (and the outer wrapper of chat-instruct).
    instruct: Box<dyn ChatTemplate>,
}

impl ChatRenderer {
    /// Combine a chat template and an instruction template.
    #[must_use]
    pub fn new(chat: Box<dyn ChatTemplate>, instruct: Box<dyn ChatTemplate>) -> Self {
        Self { chat, instruct }
    }

    /// Transcript chat template with the state's names plus `ChatML`.
    #[must_use]
    pub fn chatml(state: &ChatState) -> Self {
        Self::new(
            Box::new(NamedChatTemplate::new(&state.name1, &state.name2)),
            Box::new(ChatMlTemplate),
        )
    }

    /// Render the prompt for `user_input`, dropping old history until
    /// `count_tokens(prompt) <= max_tokens`.
    ///
    /// # Errors
    ///
    /// Propagates template and token-counting errors.
    pub fn render(
        &self,
        user_input: &str,
        state: &ChatState,
        options: RenderOptions,
        max_tokens: usize,
        count_tokens: &dyn Fn(&str) -> Result<usize>,
    ) -> Result<String> {
        let mut messages = build_messages(user_input, state, options);
        let mut prompt = self.make_prompt(&messages, user_input, state, options)?;

        while !messages.is_empty() && count_tokens(&prompt)? > max_tokens {
            let keep_system = messages.len() > 1
                && messages.first().is_some_and(|m| m.role == Role::System);
            messages.remove(usize::from(keep_system));
            prompt = self.make_prompt(&messages, user_input, state, options)?;
        }
        Ok(prompt)
    }

    /// Template used for the dialogue itself.
    fn dialogue_template(&self, mode: ChatMode) -> &dyn ChatTemplate {
        match mode {
            ChatMode::Instruct => self.instruct.as_ref(),
            ChatMode::Chat | ChatMode::ChatInstruct => self.chat.as_ref(),
        }
    }

    /// Render one candidate prompt from a message list.
    fn make_prompt(
        &self,
        messages: &[ChatMessage],
        user_input: &str,
        state: &ChatState,
        options: RenderOptions,
    ) -> Result<String> {
        let template = self.dialogue_template(state.mode);

        if state.mode == ChatMode::ChatInstruct {
            let inner = if options.continue_reply {
                let shown = messages.len().saturating_sub(1);
                template.render(messages.get(..shown).unwrap_or_default(), false)?
            } else {
                template.render(messages, false)?
            };

            let character = if options.impersonate {
                &state.name1
            } else {
                &state.name2
            };
            let command = state
                .chat_instruct_command
                .replace("<|character|>", character)
                .replace("<|prompt|>", &inner);

            let prefix = if options.continue_reply {
                let (mut prefix, _) = generation_prefix(template, options.impersonate, false)?;
                if let Some(last) = messages.last() {
                    prefix.push_str(&last.content);
                }
                prefix
            } else {
                generation_prefix(template, options.impersonate, true)?.0
            };

            let mut outer = Vec::with_capacity(3);
            if !state.custom_system_message.trim().is_empty() {
                outer.push(ChatMessage::new(Role::System, &state.custom_system_message));
            }
            if !user_input.contains(NOCHAT_MARKER) {
                outer.push(ChatMessage::new(Role::User, command));
                outer.push(ChatMessage::new(Role::Assistant, prefix));
            }

            let rendered = self.instruct.render(&outer, false)?;
            let (_, suffix) = generation_prefix(self.instruct.as_ref(), false, true)?;
            return Ok(strip_end(rendered, &suffix));
        }

        let rendered = template.render(messages, false)?;
        if options.continue_reply {
            let (_, suffix) = generation_prefix(template, options.impersonate, true)?;
            Ok(strip_end(rendered, &suffix))
        } else {
            let (prefix, _) = generation_prefix(template, options.impersonate, true)?;
            Ok(rendered + &prefix)
        }
    }
}

/// Assemble system message, history and the new user turn.
fn build_messages(user_input: &str, state: &ChatState, options: RenderOptions) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2 * state.history.len() + 2);

    let system = match state.mode {
        ChatMode::Instruct => &state.custom_system_message,
        ChatMode::Chat | ChatMode::ChatInstruct => &state.context,
    };
    if !system.trim().is_empty() {
        messages.push(ChatMessage::new(Role::System, system));
    }

    for (user, assistant) in &state.history {
        let user = user.trim();
        let assistant = assistant.trim();
        if !user.is_empty() && user != BEGIN_VISIBLE_CHAT {
            messages.push(ChatMessage::new(Role::User, user));
        }
        if !assistant.is_empty() {
            messages.push(ChatMessage::new(Role::Assistant, assistant));
        }
    }

    let user_input = user_input.trim();
    if !user_input.is_empty() && !options.impersonate && !options.continue_reply {
        messages.push(ChatMessage::new(Role::User, user_input));
    }
    messages
}

/// Remove `suffix` from the end of `text` when present.
fn strip_end(mut text: String, suffix: &str) -> String {
    if !suffix.is_empty() && text.ends_with(suffix) {
        text.truncate(text.len() - suffix.len());
    }
    text
}

/// Remove the `<|nochat|>` / `<|chat|>` directives from a rendered prompt.
#[must_use]
pub fn strip_chat_markers(prompt: &str) -> String {
    if prompt.contains(NOCHAT_MARKER) || prompt.contains(CHAT_MARKER) {
        prompt.replace(NOCHAT_MARKER, "").replace(CHAT_MARKER, "")
    } else {
        prompt.to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
