use crate::{Change, ChangeSet, ChangeSetType, DataKind, Error, Result, Selector};

use super::events::IntentCode;

/// Incremental accumulator for transports that receive whole batches of events (e.g., polling).
///
/// Follows the same rules as [`ProtocolHandler`](super::ProtocolHandler), but the caller drives
/// it explicitly instead of feeding a live event stream.
#[derive(Debug, Default)]
pub struct ChangeSetBuilder {
    intent: Option<IntentCode>,
    changes: Vec<Change>,
}

impl ChangeSetBuilder {
    pub fn new() -> ChangeSetBuilder {
        ChangeSetBuilder::default()
    }

    /// Begin a new change set with the intent code of the first server intent payload. Any
    /// accumulated changes are dropped.
    pub fn start(&mut self, intent: IntentCode) {
        self.intent = Some(intent);
        self.changes.clear();
    }

    /// Signal that changes are expected even though the server declared no changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if called before [`ChangeSetBuilder::start`].
    pub fn expect_changes(&mut self) -> Result<()> {
        let intent = self
            .intent
            .as_mut()
            .ok_or(Error::InvalidState("expect_changes called before start"))?;
        if *intent == IntentCode::None {
            *intent = IntentCode::TransferChanges;
        }
        Ok(())
    }

    pub fn add_put(&mut self, kind: DataKind, key: &str, version: u64, object: serde_json::Value) {
        self.changes.push(Change::put(kind, key, version, object));
    }

    pub fn add_delete(&mut self, kind: DataKind, key: &str, version: u64) {
        self.changes.push(Change::delete(kind, key, version));
    }

    /// Emit the accumulated change set and clear the accumulator.
    ///
    /// Once a full transfer carrying changes has been finished, later batches on the same builder
    /// are treated as incremental changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if called before [`ChangeSetBuilder::start`], or if the
    /// intent code is unknown.
    pub fn finish(&mut self, selector: Selector) -> Result<ChangeSet> {
        let intent = self
            .intent
            .ok_or(Error::InvalidState("finish called before start"))?;

        let changes = std::mem::take(&mut self.changes);
        let change_set = match intent {
            IntentCode::None => ChangeSet::none(selector),
            IntentCode::TransferFull => {
                if !changes.is_empty() {
                    self.intent = Some(IntentCode::TransferChanges);
                }
                ChangeSet::new(ChangeSetType::Full, changes, selector)
            }
            IntentCode::TransferChanges => {
                ChangeSet::new(ChangeSetType::Partial, changes, selector)
            }
            IntentCode::Unknown => return Err(Error::InvalidState("unhandled intent code")),
        };
        Ok(change_set)
    }
}
