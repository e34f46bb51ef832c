//! Typed message vocabularies, one submodule per wire module.
//!
//! Each direction of each module is one adjacently-tagged serde enum
//! (`#[serde(tag = "type", content = "payload")]`), which matches the
//! envelope's `{type, payload}` pair exactly. Commands flow client →
//! sidecar, server messages flow sidecar → client.
//!
//! # Invariants
//!
//! - Round-trip encoding through an [`crate::Envelope`] must produce an
//!   identical value (verified per module by round-trip tests).
//! - Unknown `type` strings deserialize to an error, never a panic; module
//!   clients drop them for forward compatibility.

pub mod llm;
pub mod system;
pub mod terminal;
