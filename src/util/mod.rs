// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: batched attention masks and rotary positions.

pub mod masks;
