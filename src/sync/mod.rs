//! Template propagation across nodes.
//!
//! Storage backends that are not shared need a physical copy of each
//! template per node. The engine serialises those copies: one bounded
//! queue, one consumer, and a per-template lock so two tasks for the same
//! template can never run concurrently even if the consumer is ever
//! replaced by a pool.

mod engine;

pub use engine::TemplateSyncEngine;
