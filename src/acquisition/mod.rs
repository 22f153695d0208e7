//! Acquisition state machine.
//!
//! [`AcquisitionController`] owns the frequency table, the cursor into it and
//! the output artifact of a sweep. It runs exactly one compound operation at a
//! time:
//!
//! ```text
//! Idle -> Measuring       -> Idle
//! Idle -> CorrectingOpen  -> Idle
//! Idle -> CorrectingShort -> Idle
//! ```
//!
//! A `start_*` call programs the meter and spawns a [`NotificationPoller`];
//! each [`InstrumentEvent`] the poller delivers is fed to
//! [`AcquisitionController::handle_event`], which records the sample and
//! re-triggers, or finishes the operation. [`AcquisitionController::run`]
//! drives that loop until the operation ends or is cancelled.
//!
//! Any error during a compound operation aborts it: trigger mode or the
//! correction is disarmed as far as the bus allows, the output file is closed
//! and the controller returns to [`Phase::Idle`] before the error is returned.

pub mod frequency;
pub mod output;
pub mod plot;
pub mod sample;

pub use frequency::{FrequencyPlan, FrequencyTable};
pub use output::SweepWriter;
pub use plot::{PlotSink, RecordingPlot, TracingPlot};
pub use sample::{reference_capacitance, MeasurementSample, Permittivity};

use crate::error::{AppResult, DaqError};
use crate::instrument::{CorrectionKind, Hp4284a, ImpedanceMode};
use crate::notification::{InstrumentEvent, NotificationPoller};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// The compound operation currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Phase {
    /// Nothing running; any operation may start.
    #[default]
    Idle,
    /// Open compensation running.
    CorrectingOpen,
    /// Short compensation running.
    CorrectingShort,
    /// Frequency sweep running.
    Measuring,
}

impl Phase {
    /// True for [`Phase::Idle`].
    pub fn is_idle(self) -> bool {
        self == Phase::Idle
    }

    fn for_correction(kind: CorrectionKind) -> Self {
        match kind {
            CorrectionKind::Open => Phase::CorrectingOpen,
            CorrectionKind::Short => Phase::CorrectingShort,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::CorrectingOpen => "open correction",
            Phase::CorrectingShort => "short correction",
            Phase::Measuring => "measurement",
        })
    }
}

/// Meter settings applied at the start of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Interval of the service-request poll.
    pub poll_interval: Duration,
    /// Test signal level in volts.
    pub test_voltage: f64,
    /// Long-integration averaging factor (`APER LONG,<n>`).
    pub averages: u32,
    /// Apply stored open compensation during the sweep.
    pub open_correction: bool,
    /// Apply stored short compensation during the sweep.
    pub short_correction: bool,
    /// Impedance parameter pair measured by a sweep. Only
    /// [`ImpedanceMode::CpD`] readings convert to permittivity.
    pub mode: ImpedanceMode,
    /// Wait after each frequency change before triggering.
    pub stabilization: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            test_voltage: 2.0,
            averages: crate::instrument::hp4284a::DEFAULT_AVERAGES,
            open_correction: true,
            short_correction: true,
            mode: ImpedanceMode::CpD,
            stabilization: Duration::from_millis(500),
        }
    }
}

/// Geometry and description of the sample under test.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleGeometry {
    /// Electrode area in mm².
    pub area_mm2: f64,
    /// Sample thickness in mm.
    pub thickness_mm: f64,
    /// Free text copied into the output header, one `# ` line per text line.
    pub description: String,
}

impl SampleGeometry {
    /// Area and thickness must be finite and strictly positive.
    pub fn new(area_mm2: f64, thickness_mm: f64, description: impl Into<String>) -> AppResult<Self> {
        for (name, value) in [("area", area_mm2), ("thickness", thickness_mm)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "sample {} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(Self {
            area_mm2,
            thickness_mm,
            description: description.into(),
        })
    }

    /// Vacuum capacitance of the fixture, in F.
    pub fn c0(&self) -> f64 {
        reference_capacitance(self.area_mm2, self.thickness_mm)
    }
}

/// Outcome of one handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The event does not belong to the active phase.
    Ignored,
    /// The sweep moved on; `index` is the new cursor.
    Advanced {
        /// Position of the frequency now being measured.
        index: usize,
    },
    /// The given operation finished and the controller is idle again.
    Completed(Phase),
}

/// What a finished [`AcquisitionController::run`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Operation that ran.
    pub operation: Phase,
    /// Points measured, accepted or skipped.
    pub points: usize,
    /// Points written to the output file.
    pub accepted: usize,
    /// Points dropped because the meter flagged them.
    pub skipped: usize,
    /// True when the operation was cancelled before it finished.
    pub cancelled: bool,
    /// Output file of a sweep.
    pub output: Option<PathBuf>,
}

/// Drives sweeps and corrections on a shared meter session.
pub struct AcquisitionController {
    meter: Arc<Mutex<Hp4284a>>,
    settings: AcquisitionSettings,
    plot: Box<dyn PlotSink>,
    phase: Phase,
    frequencies: Vec<f64>,
    index: usize,
    c0: f64,
    accepted: usize,
    skipped: usize,
    writer: Option<SweepWriter>,
    output: Option<PathBuf>,
    poller: Option<NotificationPoller>,
    events: Option<mpsc::Receiver<AppResult<InstrumentEvent>>>,
}

impl AcquisitionController {
    /// Creates an idle controller.
    ///
    /// The meter must already be open. `plot` receives the sweep series.
    pub fn new(
        meter: Arc<Mutex<Hp4284a>>,
        settings: AcquisitionSettings,
        plot: Box<dyn PlotSink>,
    ) -> Self {
        Self {
            meter,
            settings,
            plot,
            phase: Phase::Idle,
            frequencies: Vec::new(),
            index: 0,
            c0: 0.0,
            accepted: 0,
            skipped: 0,
            writer: None,
            output: None,
            poller: None,
            events: None,
        }
    }

    /// Active operation.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index of the frequency being measured, or the table length once the
    /// sweep has finished.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Frequencies of the current or last sweep.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Reference capacitance of the current or last sweep, in F.
    pub fn c0(&self) -> f64 {
        self.c0
    }

    /// Samples written so far.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Samples skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Output file of the current or last sweep.
    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Settings applied at sweep start.
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Shared handle to the meter session.
    pub fn meter(&self) -> Arc<Mutex<Hp4284a>> {
        Arc::clone(&self.meter)
    }

    fn ensure_idle(&self) -> AppResult<()> {
        if self.phase.is_idle() {
            Ok(())
        } else {
            Err(DaqError::OperationInProgress(self.phase))
        }
    }

    /// Starts a frequency sweep writing to `output`.
    ///
    /// Returns once the first trigger has been issued. Samples arrive through
    /// [`AcquisitionController::handle_event`] or [`AcquisitionController::run`].
    pub async fn start_measurement(
        &mut self,
        table: FrequencyTable,
        geometry: &SampleGeometry,
        output: &Path,
    ) -> AppResult<()> {
        self.ensure_idle()?;
        if table.is_empty() {
            return Err(DaqError::Configuration(
                "frequency table is empty".to_string(),
            ));
        }
        if !self.settings.mode.gives_permittivity() {
            return Err(DaqError::Configuration(format!(
                "sweeps need Cp-D readings, mode {} is not supported",
                self.settings.mode
            )));
        }

        self.phase = Phase::Measuring;
        self.frequencies.clear();
        self.index = 0;
        self.accepted = 0;
        self.skipped = 0;
        self.output = None;
        self.c0 = geometry.c0();
        info!(
            "Starting sweep over {} frequencies (C0 = {:e} F)",
            table.len(),
            self.c0
        );

        if let Err(e) = self.begin_sweep(table, geometry, output).await {
            self.abort(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn begin_sweep(
        &mut self,
        mut table: FrequencyTable,
        geometry: &SampleGeometry,
        output: &Path,
    ) -> AppResult<()> {
        {
            let mut meter = self.meter.lock().await;
            if table.needs_calibration() {
                table.calibrate(&mut meter).await?;
            }
            meter.set_impedance_mode(self.settings.mode).await?;
            meter.set_amplitude(self.settings.test_voltage).await?;
            meter.set_averages(self.settings.averages).await?;
            meter
                .set_correction_state(self.settings.open_correction, self.settings.short_correction)
                .await?;
        }
        self.frequencies = table.values().to_vec();

        let writer = SweepWriter::create(
            output,
            geometry.area_mm2,
            geometry.thickness_mm,
            self.c0,
            &geometry.description,
        )?;
        self.output = Some(writer.path().to_path_buf());
        self.writer = Some(writer);
        plot::prepare_sweep_plot(self.plot.as_mut());

        let first = self.frequency_at(0)?;
        {
            let mut meter = self.meter.lock().await;
            meter.set_frequency(first).await?;
            tokio::time::sleep(self.settings.stabilization).await;
            meter.enable_query().await?;
            meter.query_values().await?;
        }
        self.spawn_poller();
        Ok(())
    }

    /// Starts an open correction.
    pub async fn start_open_correction(&mut self) -> AppResult<()> {
        self.start_correction(CorrectionKind::Open).await
    }

    /// Starts a short correction.
    pub async fn start_short_correction(&mut self) -> AppResult<()> {
        self.start_correction(CorrectionKind::Short).await
    }

    async fn start_correction(&mut self, kind: CorrectionKind) -> AppResult<()> {
        self.ensure_idle()?;
        self.phase = Phase::for_correction(kind);
        info!("Starting {} correction", kind);

        let started = self.meter.lock().await.start_correction(kind).await;
        if let Err(e) = started {
            self.abort(&e).await;
            return Err(e);
        }
        self.spawn_poller();
        Ok(())
    }

    fn spawn_poller(&mut self) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.poller = Some(NotificationPoller::spawn(
            Arc::clone(&self.meter),
            self.settings.poll_interval,
            tx,
        ));
        self.events = Some(rx);
    }

    async fn stop_poller(&mut self) {
        self.events = None;
        if let Some(poller) = self.poller.take() {
            poller.shutdown().await;
        }
    }

    fn frequency_at(&self, index: usize) -> AppResult<f64> {
        self.frequencies.get(index).copied().ok_or_else(|| {
            DaqError::Configuration(format!("no frequency at sweep index {}", index))
        })
    }

    /// Reacts to one instrument event.
    ///
    /// Events that do not match the active phase are ignored. An error aborts
    /// the operation and leaves the controller idle.
    pub async fn handle_event(&mut self, event: InstrumentEvent) -> AppResult<Transition> {
        let result = match (self.phase, event) {
            (Phase::Measuring, InstrumentEvent::MeasurementComplete) => {
                self.on_measurement_complete().await
            }
            (Phase::CorrectingOpen | Phase::CorrectingShort, InstrumentEvent::CorrectionDone) => {
                self.on_correction_done().await
            }
            (phase, event) => {
                debug!("Ignoring {:?} during {}", event, phase);
                Ok(Transition::Ignored)
            }
        };
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    async fn on_measurement_complete(&mut self) -> AppResult<Transition> {
        let frequency = self.frequency_at(self.index)?;
        let line = self.meter.lock().await.fetch().await?;
        let sample = MeasurementSample::parse(frequency, &line)?;

        if sample.is_valid() {
            let point = Permittivity::from_sample(&sample, self.c0);
            if let Some(writer) = self.writer.as_mut() {
                writer.write_point(&point)?;
            }
            self.plot.append_point(plot::SERIES_E1, frequency, point.e1);
            self.plot.append_point(plot::SERIES_E2, frequency, point.e2);
            self.plot
                .append_point(plot::SERIES_TAN_D, frequency, point.tan_d);
            self.plot.refresh();
            self.accepted += 1;
        } else {
            warn!(
                "Skipping sample at {} Hz: status {} ('{}')",
                frequency,
                sample.status,
                line.trim()
            );
            self.skipped += 1;
        }

        self.index += 1;
        if self.index >= self.frequencies.len() {
            self.finish_sweep().await?;
            return Ok(Transition::Completed(Phase::Measuring));
        }

        let next = self.frequency_at(self.index)?;
        {
            let mut meter = self.meter.lock().await;
            meter.set_frequency(next).await?;
            tokio::time::sleep(self.settings.stabilization).await;
            meter.query_values().await?;
        }
        debug!(
            "Sweep point {}/{} at {} Hz",
            self.index + 1,
            self.frequencies.len(),
            next
        );
        Ok(Transition::Advanced { index: self.index })
    }

    async fn finish_sweep(&mut self) -> AppResult<()> {
        let disabled = self.meter.lock().await.disable_query().await;
        let finished = self.writer.take().map(SweepWriter::finish).transpose();
        self.stop_poller().await;
        self.phase = Phase::Idle;
        disabled?;
        finished?;
        info!(
            "Sweep complete: {} samples written, {} skipped",
            self.accepted, self.skipped
        );
        Ok(())
    }

    async fn on_correction_done(&mut self) -> AppResult<Transition> {
        let phase = self.phase;
        let closed = self.meter.lock().await.close_correction().await;
        self.stop_poller().await;
        self.phase = Phase::Idle;
        closed?;
        info!("{} complete", phase);
        Ok(Transition::Completed(phase))
    }

    /// Stops the active operation.
    ///
    /// A sweep stops re-triggering and keeps the samples already written; a
    /// correction is disarmed. Does nothing when idle.
    pub async fn cancel(&mut self) -> AppResult<()> {
        if self.phase.is_idle() {
            return Ok(());
        }
        info!(
            "Cancelling {} at point {}/{}",
            self.phase,
            self.index,
            self.frequencies.len()
        );
        self.wind_down().await
    }

    async fn abort(&mut self, cause: &DaqError) {
        error!("{} aborted: {}", self.phase, cause);
        if let Err(e) = self.wind_down().await {
            warn!("Cleanup after abort failed: {}", e);
        }
    }

    /// Best-effort return to idle. Every step runs; the first error is kept.
    async fn wind_down(&mut self) -> AppResult<()> {
        let disarmed = match self.phase {
            Phase::Idle => Ok(()),
            Phase::Measuring => {
                let mut meter = self.meter.lock().await;
                if meter.is_query_enabled() {
                    meter.disable_query().await
                } else {
                    Ok(())
                }
            }
            Phase::CorrectingOpen | Phase::CorrectingShort => {
                self.meter.lock().await.close_correction().await
            }
        };
        let finished = self.writer.take().map(SweepWriter::finish).transpose();
        self.stop_poller().await;
        self.phase = Phase::Idle;
        disarmed?;
        finished?;
        Ok(())
    }

    fn summary(&self, operation: Phase, cancelled: bool) -> RunSummary {
        RunSummary {
            operation,
            points: self.index,
            accepted: self.accepted,
            skipped: self.skipped,
            cancelled,
            output: self.output.clone(),
        }
    }

    /// Feeds poller events to [`AcquisitionController::handle_event`] until
    /// the active operation ends.
    ///
    /// Setting `cancel` to `true` cancels the operation. A poller error aborts
    /// it and is returned. There is no completion timeout: an instrument that
    /// never raises its completion bit keeps this waiting until cancelled.
    pub async fn run(&mut self, mut cancel: watch::Receiver<bool>) -> AppResult<RunSummary> {
        let operation = self.phase;
        if operation.is_idle() {
            return Ok(self.summary(operation, false));
        }
        let Some(mut events) = self.events.take() else {
            return Err(DaqError::NotConnected);
        };

        let mut cancel_open = true;
        loop {
            if cancel_open && *cancel.borrow() {
                self.cancel().await?;
                return Ok(self.summary(operation, true));
            }

            let received = tokio::select! {
                event = events.recv() => Some(event),
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                    None
                }
            };
            let Some(received) = received else {
                continue;
            };

            match received {
                Some(Ok(event)) => match self.handle_event(event).await? {
                    Transition::Completed(_) => return Ok(self.summary(operation, false)),
                    Transition::Advanced { index } => {
                        info!("Point {}/{} done", index, self.frequencies.len());
                    }
                    Transition::Ignored => {}
                },
                Some(Err(e)) => {
                    self.abort(&e).await;
                    return Err(e);
                }
                None => {
                    let e = DaqError::NotConnected;
                    self.abort(&e).await;
                    return Err(e);
                }
            }
        }
    }
}

impl fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("phase", &self.phase)
            .field("index", &self.index)
            .field("frequencies", &self.frequencies.len())
            .field("accepted", &self.accepted)
            .field("skipped", &self.skipped)
            .field("output", &self.output)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpib::{IbErr, MockBus, MockDevice};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    const ADDRESS: u8 = 17;

    async fn controller(plot: RecordingPlot) -> (AcquisitionController, MockDevice) {
        let bus = MockBus::new();
        let device = bus.attach(ADDRESS, "HEWLETT-PACKARD,4284A,0,REV01.20");
        let mut meter = Hp4284a::new(Box::new(bus), 0, ADDRESS).with_settle_delay(Duration::ZERO);
        meter.open().await.unwrap();
        device.clear_log();

        let settings = AcquisitionSettings {
            stabilization: Duration::ZERO,
            ..AcquisitionSettings::default()
        };
        let controller =
            AcquisitionController::new(Arc::new(Mutex::new(meter)), settings, Box::new(plot));
        (controller, device)
    }

    fn geometry() -> SampleGeometry {
        SampleGeometry::new(10.0, 1.0, "test film").unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        assert!(SampleGeometry::new(0.0, 1.0, "").is_err());
        assert!(SampleGeometry::new(10.0, -1.0, "").is_err());
        assert!(SampleGeometry::new(10.0, f64::NAN, "").is_err());
        let c0 = geometry().c0();
        assert!((c0 - 8.854e-14).abs() / 8.854e-14 < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_start_programs_meter() {
        let plot = RecordingPlot::new();
        let (mut controller, device) = controller(plot.clone()).await;
        let dir = tempdir().unwrap();
        let table = FrequencyTable::from_values(vec![20.0, 40.0]).unwrap();

        controller
            .start_measurement(table, &geometry(), &dir.path().join("a.dat"))
            .await
            .unwrap();

        assert_eq!(controller.phase(), Phase::Measuring);
        assert_eq!(controller.current_index(), 0);
        let commands = device.commands();
        assert!(commands.contains(&"FUNC:IMP:TYPE CPD".to_string()));
        assert!(commands.contains(&"VOLT 2 V".to_string()));
        assert!(commands.contains(&"CORR:OPEN:STATE ON".to_string()));
        assert!(commands.contains(&"FREQ 20 HZ".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("TRIG"));
        assert!(plot.is_visible());
        assert!(plot.series(plot::SERIES_TAN_D).is_some());

        controller.cancel().await.unwrap();
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_operation_is_refused() {
        let (mut controller, device) = controller(RecordingPlot::new()).await;
        controller.start_open_correction().await.unwrap();
        let sent = device.commands().len();

        let err = controller.start_short_correction().await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::OperationInProgress(Phase::CorrectingOpen)
        ));
        let dir = tempdir().unwrap();
        let err = controller
            .start_measurement(FrequencyTable::standard(), &geometry(), &dir.path().join("b.dat"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::OperationInProgress(_)));
        assert_eq!(device.commands().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_correction_done_returns_to_idle() {
        let (mut controller, device) = controller(RecordingPlot::new()).await;
        controller.start_short_correction().await.unwrap();
        assert_eq!(controller.phase(), Phase::CorrectingShort);

        let ignored = controller
            .handle_event(InstrumentEvent::MeasurementComplete)
            .await
            .unwrap();
        assert_eq!(ignored, Transition::Ignored);

        let done = controller
            .handle_event(InstrumentEvent::CorrectionDone)
            .await
            .unwrap();
        assert_eq!(done, Transition::Completed(Phase::CorrectingShort));
        assert_eq!(controller.phase(), Phase::Idle);
        let commands = device.commands();
        assert!(commands.contains(&"CORR:SHORT".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("*SRE 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_correction_start_leaves_idle() {
        let (mut controller, device) = controller(RecordingPlot::new()).await;
        device.fail_once("CORR:OPEN", IbErr::Enol);

        let err = controller.start_open_correction().await.unwrap_err();
        assert!(matches!(err, DaqError::ConfigurationAbort { .. }));
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(
            device.commands().last().map(String::as_str),
            Some("*SRE 0")
        );
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_flagged_sample_is_logged_and_skipped() {
        let plot = RecordingPlot::new();
        let (mut controller, device) = controller(plot.clone()).await;
        device.reply_to("FETCH?", "1.23e-9,0.0456,1\n");
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.dat");
        let table = FrequencyTable::from_values(vec![20.0, 40.0]).unwrap();
        controller
            .start_measurement(table, &geometry(), &path)
            .await
            .unwrap();

        let step = controller
            .handle_event(InstrumentEvent::MeasurementComplete)
            .await
            .unwrap();

        assert_eq!(step, Transition::Advanced { index: 1 });
        assert_eq!(controller.skipped(), 1);
        assert!(plot.points(plot::SERIES_E1).is_empty());
        assert!(logs_contain("Skipping sample at 20 Hz"));
        assert_eq!(
            device.commands().last().map(String::as_str),
            Some("TRIG")
        );
        controller.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_refuses_mode_without_permittivity() {
        let bus = MockBus::new();
        let device = bus.attach(ADDRESS, "HEWLETT-PACKARD,4284A,0,REV01.20");
        let mut meter = Hp4284a::new(Box::new(bus), 0, ADDRESS).with_settle_delay(Duration::ZERO);
        meter.open().await.unwrap();
        device.clear_log();
        let settings = AcquisitionSettings {
            mode: ImpedanceMode::LsQ,
            ..AcquisitionSettings::default()
        };
        let mut controller = AcquisitionController::new(
            Arc::new(Mutex::new(meter)),
            settings,
            Box::new(RecordingPlot::new()),
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("lsq.dat");

        let err = controller
            .start_measurement(FrequencyTable::standard(), &geometry(), &path)
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(controller.phase(), Phase::Idle);
        assert!(device.commands().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_when_idle_is_noop() {
        let (mut controller, device) = controller(RecordingPlot::new()).await;
        controller.cancel().await.unwrap();
        assert!(device.commands().is_empty());
        let summary = controller.run(watch::channel(false).1).await.unwrap();
        assert_eq!(summary.operation, Phase::Idle);
    }
}
