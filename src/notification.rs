//! Service-request notification bridge.
//!
//! The LCR meter signals completion of a correction or a triggered
//! measurement by latching a bit in its operation status register, which (when
//! enabled) asserts a service request. [`NotificationSource::check_notify`]
//! performs one serial poll and, when the request bit is set, decodes the
//! register into an [`InstrumentEvent`].
//!
//! [`NotificationPoller`] runs that check on a fixed interval in a Tokio task
//! and forwards events over an `mpsc` channel to whoever drives the
//! acquisition. A bus error is forwarded as well and ends the poller.

use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Operation status bit latched when a correction has finished.
pub const CORRECTION_COMPLETE_BIT: u16 = 1;

/// Operation status bit latched when a triggered measurement has finished.
pub const MEASUREMENT_COMPLETE_BIT: u16 = 16;

/// Logical events raised by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentEvent {
    /// An open or short correction has completed.
    CorrectionDone,
    /// A triggered measurement is ready to be fetched.
    MeasurementComplete,
}

/// Maps an operation status register value to an event.
///
/// The correction bit takes precedence over the measurement bit.
pub fn decode_operation_status(register: u16) -> Option<InstrumentEvent> {
    if register & CORRECTION_COMPLETE_BIT != 0 {
        Some(InstrumentEvent::CorrectionDone)
    } else if register & MEASUREMENT_COMPLETE_BIT != 0 {
        Some(InstrumentEvent::MeasurementComplete)
    } else {
        None
    }
}

/// Something that can be polled for pending instrument events.
#[async_trait]
pub trait NotificationSource: Send {
    /// Checks once for a pending event. `Ok(None)` means nothing happened.
    async fn check_notify(&mut self) -> AppResult<Option<InstrumentEvent>>;
}

/// Background task polling a [`NotificationSource`] on a fixed interval.
pub struct NotificationPoller {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl NotificationPoller {
    /// Starts polling `source` every `interval`, sending results on `events`.
    ///
    /// The source lock is held only for the duration of one check, so other
    /// users of the session interleave with the poller between ticks.
    pub fn spawn<S>(
        source: Arc<Mutex<S>>,
        interval: Duration,
        events: mpsc::Sender<AppResult<InstrumentEvent>>,
    ) -> Self
    where
        S: NotificationSource + ?Sized + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Notification poller started ({:?})", interval);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }

                let result = source.lock().await.check_notify().await;
                match result {
                    Ok(None) => trace!("No service request pending"),
                    Ok(Some(event)) => {
                        debug!("Instrument event: {:?}", event);
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            sent = events.send(Ok(event)) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Notification check failed: {}", e);
                        let _ = events.send(Err(e)).await;
                        break;
                    }
                }
            }

            debug!("Notification poller stopped");
        });

        Self {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// True once the polling task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops polling and waits for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Notification poller task failed: {}", e);
        }
    }
}

impl Drop for NotificationPoller {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BusError, DaqError};
    use crate::gpib::{IbErr, StatusWord};
    use std::collections::VecDeque;

    struct Scripted {
        replies: VecDeque<AppResult<Option<InstrumentEvent>>>,
        checks: usize,
    }

    #[async_trait]
    impl NotificationSource for Scripted {
        async fn check_notify(&mut self) -> AppResult<Option<InstrumentEvent>> {
            self.checks += 1;
            self.replies.pop_front().unwrap_or(Ok(None))
        }
    }

    fn scripted(replies: Vec<AppResult<Option<InstrumentEvent>>>) -> Arc<Mutex<Scripted>> {
        Arc::new(Mutex::new(Scripted {
            replies: replies.into(),
            checks: 0,
        }))
    }

    #[test]
    fn test_decode_prefers_correction_bit() {
        assert_eq!(
            decode_operation_status(17),
            Some(InstrumentEvent::CorrectionDone)
        );
        assert_eq!(
            decode_operation_status(16),
            Some(InstrumentEvent::MeasurementComplete)
        );
        assert_eq!(decode_operation_status(0), None);
        assert_eq!(decode_operation_status(8), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_forwards_events() {
        let source = scripted(vec![
            Ok(None),
            Ok(Some(InstrumentEvent::MeasurementComplete)),
            Ok(None),
            Ok(Some(InstrumentEvent::CorrectionDone)),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let poller = NotificationPoller::spawn(source.clone(), Duration::from_millis(300), tx);

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, InstrumentEvent::MeasurementComplete);
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second, InstrumentEvent::CorrectionDone);

        poller.shutdown().await;
        assert_eq!(source.lock().await.checks, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_after_error() {
        let error = DaqError::Bus(BusError::new("ibrsp", StatusWord::empty(), IbErr::Ebus, 0));
        let source = scripted(vec![Err(error)]);
        let (tx, mut rx) = mpsc::channel(8);
        let _poller = NotificationPoller::spawn(source, Duration::from_millis(100), tx);

        assert!(matches!(rx.recv().await, Some(Err(DaqError::Bus(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let source = scripted(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let poller = NotificationPoller::spawn(source.clone(), Duration::from_millis(100), tx);

        tokio::time::sleep(Duration::from_millis(350)).await;
        poller.shutdown().await;
        let checks = source.lock().await.checks;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.lock().await.checks, checks);
        assert!(checks >= 3);
    }
}
