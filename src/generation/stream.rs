// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incrementally decoded text stream over a running request.

use crate::error::Result;

use super::session::{DecodeState, GenerationSession};

/// Replacement character produced when decoding stops inside a multi-byte
/// sequence.
const REPLACEMENT: char = '\u{FFFD}';

/// Iterator of text deltas for one request.
///
/// Yields `Ok(delta)` chunks until end-of-sequence, the token budget or the
/// stop signal, then `None`. A failed step is yielded once as `Err` after
/// the session was cleaned up. Dropping the stream early also runs the
/// cleanup, so steering never outlives its request.
pub struct TextStream<'s> {
    /// Session driving the request.
    session: &'s mut GenerationSession,
    /// Decode state of the request.
    state: DecodeState,
    /// Ids emitted so far (row 0).
    tokens: Vec<u32>,
    /// Byte length of the text already yielded.
    emitted: usize,
    /// Cleanup has run.
    done: bool,
}

impl<'s> TextStream<'s> {
    /// Wrap a started request.
    pub(crate) fn new(session: &'s mut GenerationSession, state: DecodeState) -> Self {
        Self {
            session,
            state,
            tokens: Vec::new(),
            emitted: 0,
            done: false,
        }
    }

    /// Ids emitted so far.
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Ids appended to each batch row so far. Every row holds the same
    /// sequence.
    #[must_use]
    pub fn row_tokens(&self) -> &[Vec<u32>] {
        self.state.appended()
    }

    /// Run cleanup once.
    fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.session.finish(&mut self.state);
        }
    }

    /// Decode the emitted ids and return the part not yet yielded.
    ///
    /// With `hold_incomplete`, a delta ending in a replacement character is
    /// held back until the next token completes it.
    fn pending(&mut self, hold_incomplete: bool) -> Result<Option<String>> {
        let text = self.session.tokenizer().decode(&self.tokens)?;
        if hold_incomplete && text.ends_with(REPLACEMENT) {
            return Ok(None);
        }
        let delta = text.get(self.emitted..).unwrap_or_default().to_owned();
        self.emitted = text.len();
        Ok((!delta.is_empty()).then_some(delta))
    }
}

impl Iterator for TextStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.session.step(&mut self.state) {
                Ok(Some(new_tokens)) => {
                    self.tokens.extend(new_tokens);
                    match self.pending(true) {
                        Ok(Some(delta)) => return Some(Ok(delta)),
                        Ok(None) => {}
                        Err(e) => {
                            self.close();
                            return Some(Err(e));
                        }
                    }
                }
                Ok(None) => {
                    let tail = self.pending(false);
                    self.close();
                    return tail.transpose();
                }
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for TextStream<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TextStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStream")
            .field("tokens", &self.tokens.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
