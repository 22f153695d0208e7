//! Live plot collaborator.
//!
//! The acquisition pushes points to whatever implements [`PlotSink`]; drawing
//! is somebody else's job. Two sinks ship with the crate:
//! - [`RecordingPlot`] keeps every call in memory (tests, post-processing)
//! - [`TracingPlot`] turns points into log records (headless CLI)

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Series carrying the real part of the permittivity.
pub const SERIES_E1: u32 = 1;
/// Series carrying the imaginary part of the permittivity.
pub const SERIES_E2: u32 = 2;
/// Series carrying the measured loss tangent.
pub const SERIES_TAN_D: u32 = 3;

/// How a series is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeriesStyle {
    /// Connected line.
    Line,
    /// Markers only.
    Points,
    /// Line with markers.
    LinePoints,
}

/// Series colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb(
    /// Red.
    pub u8,
    /// Green.
    pub u8,
    /// Blue.
    pub u8,
);

impl Rgb {
    /// Series colour of E1r.
    pub const RED: Self = Self(255, 0, 0);
    /// Series colour of E2r.
    pub const GREEN: Self = Self(0, 160, 0);
    /// Series colour of TanD.
    pub const BLUE: Self = Self(0, 0, 255);
}

/// Receives plot updates from the acquisition.
pub trait PlotSink: Send {
    /// Removes every series.
    fn clear(&mut self);
    /// Adds an empty series `id`.
    fn new_series(&mut self, id: u32, style: SeriesStyle, color: Rgb, label: &str);
    /// Shows or hides one series.
    fn set_series_visible(&mut self, id: u32, visible: bool);
    /// Appends `(x, y)` to series `id`.
    fn append_point(&mut self, id: u32, x: f64, y: f64);
    /// Redraws after a batch of appends.
    fn refresh(&mut self);
    /// Shows the plot.
    fn show(&mut self);
    /// Hides the plot.
    fn hide(&mut self);
}

/// Creates the three sweep series on `sink`.
pub fn prepare_sweep_plot(sink: &mut dyn PlotSink) {
    sink.clear();
    sink.new_series(SERIES_E1, SeriesStyle::LinePoints, Rgb::RED, "E1r");
    sink.new_series(SERIES_E2, SeriesStyle::LinePoints, Rgb::GREEN, "E2r");
    sink.new_series(SERIES_TAN_D, SeriesStyle::LinePoints, Rgb::BLUE, "TanD");
    for id in [SERIES_E1, SERIES_E2, SERIES_TAN_D] {
        sink.set_series_visible(id, true);
    }
    sink.show();
}

/// One recorded series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedSeries {
    /// Drawing style.
    pub style: SeriesStyle,
    /// Colour.
    pub color: Rgb,
    /// Legend label.
    pub label: String,
    /// Visibility.
    pub visible: bool,
    /// Points in append order.
    pub points: Vec<(f64, f64)>,
}

#[derive(Debug, Default)]
struct PlotState {
    series: BTreeMap<u32, RecordedSeries>,
    visible: bool,
    refreshes: usize,
}

/// In-memory plot. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct RecordingPlot {
    state: Arc<Mutex<PlotState>>,
}

impl RecordingPlot {
    /// Empty, hidden plot.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of series `id`.
    pub fn series(&self, id: u32) -> Option<RecordedSeries> {
        self.lock().series.get(&id).cloned()
    }

    /// Points of series `id`, empty when it does not exist.
    pub fn points(&self, id: u32) -> Vec<(f64, f64)> {
        self.series(id).map(|s| s.points).unwrap_or_default()
    }

    /// True after `show`, false after `hide`.
    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    /// Number of `refresh` calls.
    pub fn refreshes(&self) -> usize {
        self.lock().refreshes
    }
}

impl PlotSink for RecordingPlot {
    fn clear(&mut self) {
        self.lock().series.clear();
    }

    fn new_series(&mut self, id: u32, style: SeriesStyle, color: Rgb, label: &str) {
        self.lock().series.insert(
            id,
            RecordedSeries {
                style,
                color,
                label: label.to_string(),
                visible: true,
                points: Vec::new(),
            },
        );
    }

    fn set_series_visible(&mut self, id: u32, visible: bool) {
        if let Some(series) = self.lock().series.get_mut(&id) {
            series.visible = visible;
        }
    }

    fn append_point(&mut self, id: u32, x: f64, y: f64) {
        if let Some(series) = self.lock().series.get_mut(&id) {
            series.points.push((x, y));
        }
    }

    fn refresh(&mut self) {
        self.lock().refreshes += 1;
    }

    fn show(&mut self) {
        self.lock().visible = true;
    }

    fn hide(&mut self) {
        self.lock().visible = false;
    }
}

/// Plot that only logs.
#[derive(Debug, Default)]
pub struct TracingPlot {
    labels: BTreeMap<u32, String>,
}

impl TracingPlot {
    /// Plot logging at debug level.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlotSink for TracingPlot {
    fn clear(&mut self) {
        self.labels.clear();
    }

    fn new_series(&mut self, id: u32, _style: SeriesStyle, _color: Rgb, label: &str) {
        self.labels.insert(id, label.to_string());
    }

    fn set_series_visible(&mut self, _id: u32, _visible: bool) {}

    fn append_point(&mut self, id: u32, x: f64, y: f64) {
        let label = self.labels.get(&id).map(String::as_str).unwrap_or("?");
        debug!("plot {} ({:.6e}, {:.6e})", label, x, y);
    }

    fn refresh(&mut self) {}

    fn show(&mut self) {
        info!("Plot series: {:?}", self.labels.values().collect::<Vec<_>>());
    }

    fn hide(&mut self) {}
}
