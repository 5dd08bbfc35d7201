//! Protocol used by streaming and polling transports to deliver flag data.
//!
//! A payload transfer is a sequence of events: a `server-intent` announcing whether a full data
//! set or incremental changes follow, any number of `put-object`/`delete-object` events, and a
//! `payload-transferred` event carrying the selector of the resulting data. Streaming transports
//! feed events one by one into a [`ProtocolHandler`]. Polling transports receive a whole batch at
//! once and assemble it with a [`ChangeSetBuilder`].
mod changeset_builder;
mod handler;

pub mod events;

pub use changeset_builder::ChangeSetBuilder;
pub use events::{IntentCode, ProtocolEvent};
pub use handler::{InternalErrorKind, ProtocolAction, ProtocolHandler};
