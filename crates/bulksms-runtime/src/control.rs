//! Cooperative cancellation signals
//!
//! Every executor suspension point (limiter defer, pacing sleep, retry wait,
//! transport ack wait) selects against the session's control channel, so a
//! pause or stop is observed within the current await rather than at some
//! distant loop boundary.

use core::time::Duration;

use tokio::sync::watch;

/// Operator intent for a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep pumping recipients
    Run,
    /// Persist progress and exit the loop; resumable
    Pause,
    /// Exit and purge queued retries
    Stop,
}

pub type ControlSender = watch::Sender<ControlSignal>;
pub type ControlReceiver = watch::Receiver<ControlSignal>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    watch::channel(ControlSignal::Run)
}

/// The signal currently in effect
pub fn current(control: &ControlReceiver) -> ControlSignal {
    *control.borrow()
}

/// Sleep for `duration`, waking early on a pause/stop signal.
///
/// Returns the signal in effect when the sleep ended; `Run` means the full
/// duration elapsed undisturbed. A closed channel counts as `Stop`.
pub async fn sleep_cancellable(
    duration: Duration,
    control: &mut ControlReceiver,
) -> ControlSignal {
    if duration.is_zero() {
        return current(control);
    }
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return current(control),
            changed = control.changed() => {
                if changed.is_err() {
                    return ControlSignal::Stop;
                }
                let signal = current(control);
                if signal != ControlSignal::Run {
                    return signal;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_runs_to_completion_without_signal() {
        let (_tx, mut rx) = control_channel();
        let start = Instant::now();
        let signal = sleep_cancellable(Duration::from_millis(30), &mut rx).await;
        assert_eq!(signal, ControlSignal::Run);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn pause_wakes_the_sleep_early() {
        let (tx, mut rx) = control_channel();
        let waker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(ControlSignal::Pause).unwrap();
            tx // keep the channel open
        });

        let start = Instant::now();
        let signal = sleep_cancellable(Duration::from_secs(60), &mut rx).await;
        assert_eq!(signal, ControlSignal::Pause);
        assert!(start.elapsed() < Duration::from_secs(1));
        waker.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_channel_reads_as_stop() {
        let (tx, mut rx) = control_channel();
        drop(tx);
        let signal = sleep_cancellable(Duration::from_secs(60), &mut rx).await;
        assert_eq!(signal, ControlSignal::Stop);
    }
}
