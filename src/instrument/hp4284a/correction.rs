//! Open and short fixture compensation.
//!
//! Each correction arms the operation status enable register for the
//! correction-complete bit, routes its summary to a service request and starts
//! the measurement of compensation data. The meter needs tens of seconds to
//! finish; completion arrives later as
//! [`InstrumentEvent::CorrectionDone`](crate::notification::InstrumentEvent).
//!
//! [`Hp4284a::close_correction`] disarms both registers again and must follow
//! every started correction, whether it completed or was cancelled.

use super::{Hp4284a, OPERATION_SUMMARY_SRE};
use crate::error::AppResult;
use crate::notification::CORRECTION_COMPLETE_BIT;
use std::fmt;
use tracing::{debug, info};

/// Which fixture compensation to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrectionKind {
    /// Open-circuit compensation (fixture with nothing inserted).
    Open,
    /// Short-circuit compensation (fixture shorted).
    Short,
}

impl CorrectionKind {
    /// Command starting the compensation measurement.
    pub fn start_command(self) -> &'static str {
        match self {
            Self::Open => "CORR:OPEN",
            Self::Short => "CORR:SHORT",
        }
    }

    /// Full arm-and-start sequence.
    pub fn sequence(self) -> Vec<String> {
        vec![
            "*CLS".to_string(),
            format!("STAT:OPER:ENAB {}", CORRECTION_COMPLETE_BIT),
            format!("*SRE {}", OPERATION_SUMMARY_SRE),
            self.start_command().to_string(),
        ]
    }
}

impl fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Short => f.write_str("short"),
        }
    }
}

impl Hp4284a {
    /// Starts an open-circuit correction.
    pub async fn open_correction(&mut self) -> AppResult<()> {
        self.start_correction(CorrectionKind::Open).await
    }

    /// Starts a short-circuit correction.
    pub async fn short_correction(&mut self) -> AppResult<()> {
        self.start_correction(CorrectionKind::Short).await
    }

    /// Arms the completion notification and starts `kind`.
    ///
    /// The correction counts as armed from the first step on, so
    /// [`Hp4284a::close_correction`] disarms the registers even when a later
    /// step failed.
    pub async fn start_correction(&mut self, kind: CorrectionKind) -> AppResult<()> {
        self.device.handle()?;
        self.correction = Some(kind);
        self.device.run_sequence(&kind.sequence()).await?;
        info!("{} correction started", kind);
        Ok(())
    }

    /// Disarms the correction notification and clears status.
    ///
    /// Does nothing when no correction is armed, so calling it twice is the
    /// same as calling it once. If the disarm sequence fails the correction
    /// stays armed and a later call sends the whole sequence again.
    pub async fn close_correction(&mut self) -> AppResult<()> {
        let Some(kind) = self.correction else {
            debug!("close_correction: nothing armed");
            return Ok(());
        };
        self.device
            .run_sequence(&[
                "STAT:OPER:ENAB 0".to_string(),
                "*CLS".to_string(),
                "*SRE 0".to_string(),
            ])
            .await?;
        self.correction = None;
        debug!("{} correction closed", kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use crate::gpib::{IbErr, MockBus};
    use crate::notification::{InstrumentEvent, NotificationSource};
    use std::time::Duration;

    async fn meter(bus: &MockBus) -> Hp4284a {
        let mut meter =
            Hp4284a::new(Box::new(bus.clone()), 0, 17).with_settle_delay(Duration::ZERO);
        meter.open().await.unwrap();
        meter
    }

    #[tokio::test]
    async fn test_open_correction_sequence() {
        let bus = MockBus::new();
        let mock = bus.attach(17, "HEWLETT-PACKARD,4284A");
        let mut meter = meter(&bus).await;
        mock.clear_log();

        meter.open_correction().await.unwrap();
        assert_eq!(
            mock.commands(),
            vec!["*CLS", "STAT:OPER:ENAB 1", "*SRE 128", "CORR:OPEN"]
        );
        assert_eq!(meter.active_correction(), Some(CorrectionKind::Open));
    }

    #[tokio::test]
    async fn test_short_correction_completion() {
        let bus = MockBus::new();
        let mock = bus.attach(17, "HEWLETT-PACKARD,4284A");
        let mut meter = meter(&bus).await;

        meter.short_correction().await.unwrap();
        mock.queue_status_byte(0xC0);
        mock.reply_to("STAT:OPER?", "1\n");
        assert_eq!(
            meter.check_notify().await.unwrap(),
            Some(InstrumentEvent::CorrectionDone)
        );
    }

    #[tokio::test]
    async fn test_close_correction_twice() {
        let bus = MockBus::new();
        let mock = bus.attach(17, "HEWLETT-PACKARD,4284A");
        let mut meter = meter(&bus).await;
        meter.open_correction().await.unwrap();
        mock.clear_log();

        meter.close_correction().await.unwrap();
        let after_first = mock.commands();
        meter.close_correction().await.unwrap();

        assert_eq!(after_first, vec!["STAT:OPER:ENAB 0", "*CLS", "*SRE 0"]);
        assert_eq!(mock.commands(), after_first);
        assert_eq!(meter.active_correction(), None);
    }

    #[tokio::test]
    async fn test_failed_close_stays_armed_until_retried() {
        let bus = MockBus::new();
        let mock = bus.attach(17, "HEWLETT-PACKARD,4284A");
        let mut meter = meter(&bus).await;
        meter.open_correction().await.unwrap();
        mock.fail_once("STAT:OPER:ENAB 0", IbErr::Ebus);
        mock.clear_log();

        assert!(meter.close_correction().await.is_err());
        assert_eq!(meter.active_correction(), Some(CorrectionKind::Open));

        meter.close_correction().await.unwrap();
        assert_eq!(mock.commands(), vec!["STAT:OPER:ENAB 0", "*CLS", "*SRE 0"]);
        assert_eq!(meter.active_correction(), None);
    }

    #[tokio::test]
    async fn test_failed_start_can_still_be_closed() {
        let bus = MockBus::new();
        let mock = bus.attach(17, "HEWLETT-PACKARD,4284A");
        let mut meter = meter(&bus).await;
        mock.fail_once("CORR:SHORT", IbErr::Eabo);
        mock.clear_log();

        match meter.short_correction().await.unwrap_err() {
            DaqError::ConfigurationAbort { step, .. } => assert_eq!(step, "CORR:SHORT"),
            other => panic!("unexpected error {other:?}"),
        }
        meter.close_correction().await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "*CLS",
                "STAT:OPER:ENAB 1",
                "*SRE 128",
                "STAT:OPER:ENAB 0",
                "*CLS",
                "*SRE 0"
            ]
        );
    }
}
