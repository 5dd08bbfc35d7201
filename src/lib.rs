//! Data acquisition layer of the Eppo SDK: keeps a local copy of flag configuration synchronized
//! with the Eppo service.
//!
//! # Overview
//!
//! Flag data is delivered by data sources. [Initializers](polling::PollingInitializer) fetch a
//! snapshot once. [Synchronizers](streaming::StreamingSynchronizer) keep receiving updates. Both
//! speak the same protocol: a server intent, a number of put/delete events, and a
//! `payload-transferred` event carrying a [`Selector`] that identifies the resulting data (see
//! [`protocol`]).
//!
//! Data sources never touch storage directly. They push [`ChangeSet`]s and status changes into a
//! [`DataSourceUpdates`] sink. The production sink is
//! [`DataSourceUpdatesImpl`](data_source_updates::DataSourceUpdatesImpl), which writes into a
//! [`DataStore`](data_store::DataStore), works out which flags are affected by each change, and
//! notifies listeners.
//!
//! Several data sources are supervised by a [`CompositeSource`](composite::CompositeSource),
//! which runs one of them at a time and switches between them as their failure policies dictate.
//! [`DataSystem`] puts all of this together:
//!
//! ```text
//!  initializers ─┐
//!                ├─► CompositeSource ─► InitTracker ─► DataSourceUpdatesImpl ─► DataStore
//! synchronizers ─┘                                                          └─► listeners
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Data source failures do not surface as errors to
//! the application. They are reported as [`DataSourceStatus`] transitions carrying an
//! [`ErrorInfo`] instead.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! the `eppo` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod changeset;
mod completion;
mod data_source;
mod dependency_tracker;
mod error;
mod sanitizer;
mod status;

pub mod composite;
pub mod data_source_updates;
pub mod data_store;
pub mod data_system;
pub mod init_tracker;
pub mod polling;
pub mod protocol;
pub mod streaming;

#[cfg(test)]
mod test_utils;

pub use changeset::{
    Change, ChangeSet, ChangeSetType, ChangeType, DataKind, FullDataSet, ItemDescriptor,
    KindAndKey, Selector,
};
pub use completion::Completion;
pub use data_source::{DataSource, DataSourceFactory, DataSourceUpdates};
pub use data_system::{DataSystem, DataSystemConfig};
pub use error::{Error, Result};
pub use sanitizer::StatusSanitizer;
pub use status::{
    is_http_error_recoverable, DataSourceState, DataSourceStatus, ErrorInfo, ErrorKind,
};
