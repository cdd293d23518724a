//! Typed events emitted during a pipeline run: type, node id, free-form data, timestamp.
//!
//! This crate defines the wire-independent shape of one engine event. It has no
//! dependency on the engine crate itself so embedders can match on event types
//! without pulling in the whole graph runtime.

pub mod event;

pub use event::{EngineEvent, EventType};
