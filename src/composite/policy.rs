use std::{
    sync::{Mutex, Weak},
    time::Duration,
};

use crate::{DataSourceState, ErrorInfo};

use super::{source::CompositeInner, timer::Timer};

/// Selects how a [`CompositeSource`](super::CompositeSource) reacts to signals from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Move on to the next source as soon as the current one is interrupted, turns off, or fails
    /// to store data. Used for initializers.
    FailFast,
    /// Retire the source permanently once it has delivered data or turned off. Used for one-shot
    /// sources (e.g., the initializer tier).
    BlacklistOnSuccessOrOff,
    /// Tolerate interruptions for a while before falling back, and return to the primary source
    /// after a while. A source that turns off is blacklisted as it falls back, so it is never
    /// retried. Used for synchronizers.
    TimedFallback,
}

/// Timings for [`PolicyKind::TimedFallback`].
#[derive(Debug, Clone)]
pub struct TimedFallbackConfig {
    /// How long a source may stay interrupted before falling back to the next one.
    ///
    /// Defaults to [`TimedFallbackConfig::DEFAULT_FALLBACK_DELAY`].
    pub fallback_delay: Duration,
    /// How long a healthy non-primary source is used before retrying the primary one.
    ///
    /// Defaults to [`TimedFallbackConfig::DEFAULT_RECOVERY_DELAY`].
    pub recovery_delay: Duration,
}

impl TimedFallbackConfig {
    /// Default value for [`TimedFallbackConfig::fallback_delay`].
    pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(2 * 60);
    /// Default value for [`TimedFallbackConfig::recovery_delay`].
    pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(5 * 60);

    pub fn new() -> TimedFallbackConfig {
        TimedFallbackConfig::default()
    }

    pub fn with_fallback_delay(mut self, delay: Duration) -> TimedFallbackConfig {
        self.fallback_delay = delay;
        self
    }

    pub fn with_recovery_delay(mut self, delay: Duration) -> TimedFallbackConfig {
        self.recovery_delay = delay;
        self
    }
}

impl Default for TimedFallbackConfig {
    fn default() -> TimedFallbackConfig {
        TimedFallbackConfig {
            fallback_delay: TimedFallbackConfig::DEFAULT_FALLBACK_DELAY,
            recovery_delay: TimedFallbackConfig::DEFAULT_RECOVERY_DELAY,
        }
    }
}

/// A multi-step state change requested by a policy. Runs as a single queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Transition {
    /// Dispose the current source, then start the next one.
    Fallback,
    /// Blacklist the current entry, dispose the current source, then start the next one.
    BlacklistAndFallback,
    /// Dispose the current source, then start the first one.
    Recover,
}

/// Handle through which a policy requests transitions for the source it observes.
#[derive(Clone)]
pub(super) struct PolicyContext {
    composite: Weak<CompositeInner>,
    /// Generation of the observed source. Requests become stale once the source is replaced.
    owner: u64,
}

impl PolicyContext {
    pub(super) fn new(composite: Weak<CompositeInner>, owner: u64) -> PolicyContext {
        PolicyContext { composite, owner }
    }

    fn request(&self, transition: Transition) {
        if let Some(composite) = self.composite.upgrade() {
            composite.transition(self.owner, transition);
        }
    }
}

/// Observes a single source instance and decides when the composite should move away from it.
pub(super) enum FailurePolicy {
    FailFast(PolicyContext),
    BlacklistOnSuccessOrOff(PolicyContext),
    TimedFallback(TimedFallback),
}

impl FailurePolicy {
    pub(super) fn new(
        kind: PolicyKind,
        context: PolicyContext,
        config: &TimedFallbackConfig,
        is_primary: bool,
    ) -> FailurePolicy {
        match kind {
            PolicyKind::FailFast => FailurePolicy::FailFast(context),
            PolicyKind::BlacklistOnSuccessOrOff => FailurePolicy::BlacklistOnSuccessOrOff(context),
            PolicyKind::TimedFallback => FailurePolicy::TimedFallback(TimedFallback {
                context,
                config: config.clone(),
                is_primary,
                timers: Mutex::new(FallbackTimers::default()),
            }),
        }
    }

    /// Called after the downstream sink has processed data from the source.
    pub(super) fn on_data(&self, stored: bool) {
        match self {
            FailurePolicy::FailFast(context) => {
                if !stored {
                    context.request(Transition::Fallback);
                }
            }
            FailurePolicy::BlacklistOnSuccessOrOff(context) => {
                if stored {
                    context.request(Transition::BlacklistAndFallback);
                }
            }
            FailurePolicy::TimedFallback(policy) => {
                if stored {
                    policy.healthy();
                } else {
                    policy.interrupted();
                }
            }
        }
    }

    /// Called after the downstream sink has processed a status change of the source.
    pub(super) fn on_status(&self, state: DataSourceState, error: Option<&ErrorInfo>) {
        match self {
            FailurePolicy::FailFast(context) => {
                if matches!(state, DataSourceState::Interrupted | DataSourceState::Off)
                    || error.is_some()
                {
                    context.request(Transition::Fallback);
                }
            }
            FailurePolicy::BlacklistOnSuccessOrOff(context) => {
                if state == DataSourceState::Off {
                    context.request(Transition::BlacklistAndFallback);
                }
            }
            FailurePolicy::TimedFallback(policy) => match state {
                DataSourceState::Valid => policy.healthy(),
                DataSourceState::Interrupted => policy.interrupted(),
                // Off means the source hit an unrecoverable error (e.g., a rejected SDK key).
                // Synchronizer lists are circular, so a plain fallback would bring the source
                // back on the next lap or on recovery and fail the same way forever. Falling back
                // immediately and blacklisting the entry keeps it out of rotation for good.
                DataSourceState::Off => policy.context.request(Transition::BlacklistAndFallback),
                DataSourceState::Initializing => {}
            },
        }
    }

    /// Cancel pending timers. Idempotent.
    pub(super) fn dispose(&self) {
        if let FailurePolicy::TimedFallback(policy) = self {
            policy.dispose();
        }
    }
}

#[derive(Default)]
struct FallbackTimers {
    fallback: Option<Timer>,
    recovery: Option<Timer>,
    disposed: bool,
}

pub(super) struct TimedFallback {
    context: PolicyContext,
    config: TimedFallbackConfig,
    /// Whether the observed source was created from the first entry of the list.
    is_primary: bool,
    timers: Mutex<FallbackTimers>,
}

impl TimedFallback {
    fn interrupted(&self) {
        let mut timers = self
            .timers
            .lock()
            .expect("thread holding policy timers lock should not panic");
        if timers.disposed {
            return;
        }

        timers.recovery = None;
        if timers.fallback.is_none() {
            log::debug!(
                target: "eppo",
                "source interrupted, falling back in {:?} unless it recovers",
                self.config.fallback_delay
            );
            let context = self.context.clone();
            timers.fallback = Timer::schedule(
                "eppo-fallback",
                self.config.fallback_delay,
                move || context.request(Transition::Fallback),
            );
        }
    }

    fn healthy(&self) {
        let mut timers = self
            .timers
            .lock()
            .expect("thread holding policy timers lock should not panic");
        if timers.disposed {
            return;
        }

        if timers.fallback.take().is_some() {
            log::debug!(target: "eppo", "source recovered, fallback cancelled");
        }
        if !self.is_primary && timers.recovery.is_none() {
            let context = self.context.clone();
            timers.recovery = Timer::schedule(
                "eppo-recovery",
                self.config.recovery_delay,
                move || context.request(Transition::Recover),
            );
        }
    }

    fn dispose(&self) {
        let mut timers = self
            .timers
            .lock()
            .expect("thread holding policy timers lock should not panic");
        timers.disposed = true;
        timers.fallback = None;
        timers.recovery = None;
    }
}
