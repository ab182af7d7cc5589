//! Canonical dynamically-typed value and mapping types
//!
//! Every free-form payload in the engine (step input/output, workflow
//! context, metadata, event data) is a string-keyed mapping to a
//! [`serde_json::Value`]. This is the one canonical type the whole crate
//! commits to so that round-tripping through a durable store's
//! serialization format (JSON-equivalent) never requires a conversion
//! layer.

use std::collections::HashMap;

use serde_json::Value;

/// A string-keyed mapping of dynamically-typed values.
pub type ValueMap = HashMap<String, Value>;

/// Overlay `patch` onto `base`, with `patch` winning on key collisions.
///
/// This is the "last writer wins" merge rule used both when building a
/// step's input (workflow input, then dependency outputs, then context) and
/// when folding a completed step's output back into the workflow context.
pub fn overlay(base: &mut ValueMap, patch: &ValueMap) {
    for (k, v) in patch {
        base.insert(k.clone(), v.clone());
    }
}
