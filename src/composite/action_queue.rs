use std::{collections::VecDeque, sync::Mutex};

/// A unit of work bound to the source generation that was live when it was enqueued.
pub(crate) struct QueuedAction {
    owner: u64,
    action: Box<dyn FnOnce() + Send>,
}

impl QueuedAction {
    pub(crate) fn new(owner: u64, action: impl FnOnce() + Send + 'static) -> QueuedAction {
        QueuedAction {
            owner,
            action: Box::new(action),
        }
    }
}

#[derive(Default)]
struct QueueState {
    actions: VecDeque<QueuedAction>,
    /// `true` while some thread is draining the queue.
    processing: bool,
}

/// Lock-protected FIFO of actions executed by at most one thread at a time.
///
/// The thread that enqueues into an idle queue becomes the drainer and runs actions one by one
/// until the queue is empty. Actions run outside of the lock, so an action may enqueue more work
/// (directly or through callbacks it triggers). Such work is picked up by the same drain loop
/// instead of recursing, which keeps stack depth bounded.
#[derive(Default)]
pub(crate) struct ActionQueue {
    state: Mutex<QueueState>,
}

impl ActionQueue {
    pub(crate) fn new() -> ActionQueue {
        ActionQueue::default()
    }

    /// Enqueue `action` and drain the queue if no other thread is draining it.
    ///
    /// `live_owner` is consulted right before each action runs. Actions whose owner does not match
    /// are stale and are dropped.
    pub(crate) fn enqueue(&self, action: QueuedAction, live_owner: impl Fn() -> u64) {
        {
            let mut state = self
                .state
                .lock()
                .expect("thread holding action queue lock should not panic");
            state.actions.push_back(action);
            if state.processing {
                return;
            }
            state.processing = true;
        }

        let _guard = ProcessingGuard { queue: self };
        while let Some(next) = self.pop() {
            if next.owner != live_owner() {
                log::debug!(target: "eppo", owner = next.owner; "dropping stale action");
                continue;
            }
            (next.action)();
        }
    }

    /// Pop the next action. Clears the `processing` flag under the same lock if the queue is empty,
    /// so no action can be left behind by a drainer that is about to exit.
    fn pop(&self) -> Option<QueuedAction> {
        let mut state = self
            .state
            .lock()
            .expect("thread holding action queue lock should not panic");
        let next = state.actions.pop_front();
        if next.is_none() {
            state.processing = false;
        }
        next
    }
}

/// Releases the drainer role if an action panics.
struct ProcessingGuard<'a> {
    queue: &'a ActionQueue,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Ok(mut state) = self.queue.state.lock() {
                state.processing = false;
            }
        }
    }
}
