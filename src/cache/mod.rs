// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key/value caching for batched autoregressive generation.
//!
//! - [`KVCache`]: per-layer key/value cache sized to the steering batch.

mod kv;

pub use kv::KVCache;
