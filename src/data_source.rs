//! Contracts between data sources, the components that supervise them, and the update propagation
//! engine.
use std::sync::Arc;

use crate::{
    ChangeSet, Completion, DataKind, DataSourceState, ErrorInfo, FullDataSet, ItemDescriptor,
    Selector,
};

/// The sink a data source pushes received data and status changes into.
///
/// Transport adapters are handed an implementation of this trait and never touch the data store
/// directly. Data methods return `true` if the data has been stored successfully.
pub trait DataSourceUpdates: Send + Sync {
    /// Replace all data.
    fn init(&self, data: FullDataSet) -> bool;

    /// Insert or update a single item.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool;

    /// Apply a change set.
    fn apply(&self, change_set: ChangeSet) -> bool;

    /// Report a status change of the data source.
    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>);

    /// Selector of the most recently stored data. Data sources send it to the server to resume
    /// from where they left off.
    fn selector(&self) -> Selector {
        Selector::empty()
    }
}

/// A source of flag configuration data (e.g., a streaming connection or a poller).
pub trait DataSource: Send + Sync {
    /// Start acquiring data.
    ///
    /// Must not block on network I/O. The returned [`Completion`] resolves to `true` once data has
    /// been received, or to `false` if the source gave up.
    fn start(&self) -> Completion;

    /// Stop the data source and release its resources.
    ///
    /// Must be idempotent, safe to call from any thread, and must not block on in-flight work.
    /// A disposed data source should stop calling into its [`DataSourceUpdates`].
    fn dispose(&self);
}

/// Creates data source instances bound to a sink.
///
/// A factory may be invoked several times over the lifetime of the SDK (e.g., when the supervisor
/// falls back to a data source it used before).
pub trait DataSourceFactory: Send + Sync {
    fn create(&self, updates: Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource>;
}

impl<T> DataSourceFactory for T
where
    T: Fn(Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource> + Send + Sync,
{
    fn create(&self, updates: Arc<dyn DataSourceUpdates>) -> Arc<dyn DataSource> {
        self(updates)
    }
}
