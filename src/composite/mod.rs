//! Supervision of several data sources behind a single [`DataSource`](crate::DataSource).
//!
//! A [`CompositeSource`] owns an ordered list of source factories, each paired with a
//! [`PolicyKind`]. It runs one source at a time. Everything the source reports is forwarded to the
//! downstream sink (through a [`StatusSanitizer`](crate::StatusSanitizer)) and then
//! shown to the failure policy, which may ask the composite to move on to another source.
//!
//! Switching sources is serialized through an action queue that is drained iteratively by
//! whichever thread finds it idle, so a source reacting to its own replacement cannot grow the
//! stack.
mod action_queue;
mod policy;
mod source;
mod timer;

pub use policy::{PolicyKind, TimedFallbackConfig};
pub use source::{CompositeSource, CompositeSourceConfig};
