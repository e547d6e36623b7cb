//! Imperative management operations.
//!
//! Unlike the reconcilers, these paths are caller-facing: validation
//! failures (wrong status, unknown references) are returned as errors and
//! never retried internally. Each operation round-trips through the
//! cluster API, waits for the remote task, then updates persistence
//! eagerly so readers do not have to wait for the next resync.

mod template;
mod vm;

pub use template::TemplateOps;
pub use vm::VmOps;
