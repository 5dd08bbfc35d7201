use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

/// A delayed callback running on its own thread. Dropping the timer cancels it.
pub(crate) struct Timer {
    _cancel_guard: DropGuard,
}

impl Timer {
    /// Run `callback` after `delay` unless the returned timer is dropped first.
    ///
    /// Returns `None` if the timer thread could not be spawned.
    pub(crate) fn schedule(
        name: &str,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Option<Timer> {
        let cancel_token = CancellationToken::new();

        let spawned = {
            let cancel_token = cancel_token.clone();
            std::thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || run(cancel_token, delay, callback))
        };

        match spawned {
            Ok(_) => Some(Timer {
                _cancel_guard: cancel_token.drop_guard(),
            }),
            Err(err) => {
                log::warn!(target: "eppo", "failed to spawn timer thread: {err}");
                None
            }
        }
    }
}

fn run(cancel_token: CancellationToken, delay: Duration, callback: impl FnOnce()) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log::warn!(target: "eppo", "failed to start timer runtime: {err}");
            return;
        }
    };

    let fired = runtime.block_on(async {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    });

    if fired {
        callback();
    } else {
        log::trace!(target: "eppo", "timer cancelled");
    }
}
