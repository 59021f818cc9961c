//! Display modes: each turns a sample window into the curve a plot would
//! show, together with the axis description needed to draw it.
//!
//! Four modes are supported: raw positions, linear FFT, FFT on a log
//! frequency axis (amplitude × frequency, optionally smoothed over successive
//! windows) and integrated displacement with an optional background.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::drivers::fft::{
    bucket_frequencies, compute_gaps, condense, decimated_fft, fft_axis, scaled_abs_fft,
};

const MICROMETRE: &str = "µm";
/// Raw mode shows milliseconds up to this many samples, seconds beyond.
const MS_AXIS_LIMIT: usize = 10_000;
/// Approximate number of log buckets for the FFT (log f) view.
const LOG_FFT_POINTS: usize = 1000;
/// Approximate number of log buckets for the integrated view.
const INTEGRATED_POINTS: usize = 5000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Raw,
    Fft,
    FftLogF,
    Integrated,
}

impl ModeKind {
    pub const ALL: [ModeKind; 4] = [
        ModeKind::Raw,
        ModeKind::Fft,
        ModeKind::FftLogF,
        ModeKind::Integrated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModeKind::Raw => "Raw Signal",
            ModeKind::Fft => "FFT",
            ModeKind::FftLogF => "FFT (log f)",
            ModeKind::Integrated => "Integrated",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisScale {
    Linear,
    Log,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AxisInfo {
    pub name: String,
    pub units: String,
    pub scale: AxisScale,
    pub min: f64,
    pub max: f64,
}

impl AxisInfo {
    fn new(name: &str, units: &str, scale: AxisScale, min: f64, max: f64) -> Self {
        Self {
            name: name.to_owned(),
            units: units.to_owned(),
            scale,
            min,
            max,
        }
    }

    /// Axis title in the form `Name (units)`.
    pub fn title(&self) -> String {
        format!("{} ({})", self.name, self.units)
    }
}

/// Min/max per decimated group, reported alongside the group means.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub min: Array2<f64>,
    pub max: Array2<f64>,
}

/// Result of one transform: X/Y curves against a shared axis.
#[derive(Clone, Debug)]
pub struct ModeOutput {
    pub axis: Array1<f64>,
    pub values: Array2<f64>,
    pub envelope: Option<Envelope>,
    /// Stored background curve, integrated mode only.
    pub background: Option<Array2<f64>>,
}

impl ModeOutput {
    fn plain(axis: Array1<f64>, values: Array2<f64>) -> Self {
        Self {
            axis,
            values,
            envelope: None,
            background: None,
        }
    }
}

/// Smallest and largest finite value, ignoring NaN.
pub fn finite_range<'a>(values: impl IntoIterator<Item = &'a f64>) -> Option<(f64, f64)> {
    values
        .into_iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Picks `current` if still allowed, otherwise the largest allowed choice.
fn pick_decimation(choices: &[usize], current: usize, valid: impl Fn(usize) -> bool) -> usize {
    if valid(current) {
        return current;
    }
    choices
        .iter()
        .copied()
        .filter(|&d| valid(d))
        .last()
        .unwrap_or(1)
}

pub struct RawMode {
    f_s: f64,
    timebase: usize,
    decimation: usize,
    time_scale: f64,
    time_units: &'static str,
    axis: Array1<f64>,
    y_range: (f64, f64),
}

impl RawMode {
    pub const DECIMATIONS: [usize; 3] = [1, 100, 1000];

    fn new(timebase: usize, f_s: f64) -> Self {
        let mut mode = Self {
            f_s,
            timebase,
            decimation: 1,
            time_scale: 1e3,
            time_units: "ms",
            axis: Array1::zeros(0),
            y_range: (-10.0, 10.0),
        };
        mode.set_timebase(timebase, f_s);
        mode
    }

    /// Decimations that leave at least 50 points on screen.
    pub fn valid_decimations(&self) -> Vec<usize> {
        let timebase = self.timebase;
        Self::DECIMATIONS
            .iter()
            .copied()
            .filter(|&d| 50 * d < timebase)
            .collect()
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }

    pub fn set_decimation(&mut self, decimation: usize) {
        let timebase = self.timebase;
        self.decimation = pick_decimation(&Self::DECIMATIONS, decimation, |d| {
            Self::DECIMATIONS.contains(&d) && 50 * d < timebase
        });
        let step = self.time_scale / self.f_s * self.decimation as f64;
        self.axis = (0..self.timebase / self.decimation)
            .map(|k| step * k as f64)
            .collect();
    }

    fn set_timebase(&mut self, timebase: usize, f_s: f64) {
        self.timebase = timebase;
        self.f_s = f_s;
        if timebase <= MS_AXIS_LIMIT {
            self.time_scale = 1e3;
            self.time_units = "ms";
        } else {
            self.time_scale = 1.0;
            self.time_units = "s";
        }
        self.set_decimation(self.decimation);
    }

    fn compute(&self, window: ArrayView2<f64>) -> ModeOutput {
        let d = self.decimation;
        if d == 1 {
            return ModeOutput::plain(self.axis.clone(), window.to_owned());
        }
        let groups = window.nrows() / d;
        let mut mean = Array2::zeros((groups, 2));
        let mut min = Array2::zeros((groups, 2));
        let mut max = Array2::zeros((groups, 2));
        for g in 0..groups {
            let group = window.slice(s![g * d..(g + 1) * d, ..]);
            for c in 0..2 {
                let column = group.column(c);
                mean[[g, c]] = column.sum() / d as f64;
                min[[g, c]] = column.fold(f64::INFINITY, |a, &b| a.min(b));
                max[[g, c]] = column.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            }
        }
        ModeOutput {
            axis: self.axis.clone(),
            values: mean,
            envelope: Some(Envelope { min, max }),
            background: None,
        }
    }

    fn x_axis(&self) -> AxisInfo {
        let xmax = self.time_scale / self.f_s * self.timebase as f64;
        AxisInfo::new("Time", self.time_units, AxisScale::Linear, 0.0, xmax)
    }

    fn y_axis(&self) -> AxisInfo {
        let (lo, hi) = self.y_range;
        AxisInfo::new("Position", MICROMETRE, AxisScale::Linear, lo, hi)
    }

    /// Fits the window's range with a 20% margin either side.
    fn rescale(&mut self, window: ArrayView2<f64>) -> (f64, f64) {
        self.fit_values(window.iter())
    }

    /// Same fit from a computed output, using the envelope when decimated.
    fn fit(&mut self, output: &ModeOutput) -> (f64, f64) {
        match &output.envelope {
            Some(envelope) => self.fit_values(envelope.min.iter().chain(envelope.max.iter())),
            None => self.fit_values(output.values.iter()),
        }
    }

    fn fit_values<'a>(&mut self, values: impl IntoIterator<Item = &'a f64>) -> (f64, f64) {
        if let Some((lo, hi)) = finite_range(values) {
            let margin = 0.2 * (hi - lo);
            self.y_range = (lo - margin, hi + margin);
        }
        self.y_range
    }
}

pub struct FftMode {
    f_s: f64,
    timebase: usize,
    decimation: usize,
    squared: bool,
    axis: Array1<f64>,
    y_max: f64,
    y_min: Option<f64>,
}

impl FftMode {
    pub const DECIMATIONS: [usize; 3] = [1, 10, 100];
    const Y_MIN: f64 = 1e-4;

    fn new(timebase: usize, f_s: f64) -> Self {
        let mut mode = Self {
            f_s,
            timebase,
            decimation: 1,
            squared: false,
            axis: Array1::zeros(0),
            y_max: 1.0,
            y_min: None,
        };
        mode.set_timebase(timebase, f_s);
        mode
    }

    /// Decimations leaving segments of at least 1000 samples.
    pub fn valid_decimations(&self) -> Vec<usize> {
        let timebase = self.timebase;
        Self::DECIMATIONS
            .iter()
            .copied()
            .filter(|&d| 1000 * d <= timebase)
            .collect()
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }

    pub fn set_decimation(&mut self, decimation: usize) {
        let timebase = self.timebase;
        self.decimation = pick_decimation(&Self::DECIMATIONS, decimation, |d| {
            Self::DECIMATIONS.contains(&d) && 1000 * d <= timebase
        });
        self.axis = fft_axis(self.timebase / self.decimation, self.f_s, 1e-3);
    }

    pub fn squared(&self) -> bool {
        self.squared
    }

    /// Switches between amplitude density and power density.
    pub fn set_squared(&mut self, squared: bool) {
        self.squared = squared;
        self.y_min = None;
        self.y_max = 1.0;
    }

    fn set_timebase(&mut self, timebase: usize, f_s: f64) {
        self.timebase = timebase;
        self.f_s = f_s;
        self.set_decimation(self.decimation);
    }

    fn compute(&self, window: ArrayView2<f64>) -> ModeOutput {
        let spectrum = decimated_fft(window, self.f_s, self.decimation);
        let values = if self.squared {
            spectrum.mapv(|v| v * v)
        } else {
            spectrum
        };
        ModeOutput::plain(self.axis.clone(), values)
    }

    fn x_axis(&self) -> AxisInfo {
        AxisInfo::new(
            "Frequency",
            "kHz",
            AxisScale::Linear,
            0.0,
            1e-3 * self.f_s / 2.0,
        )
    }

    fn y_axis(&self) -> AxisInfo {
        let (units, default_min) = if self.squared {
            ("µm²/Hz", Self::Y_MIN * Self::Y_MIN)
        } else {
            ("µm/√Hz", Self::Y_MIN)
        };
        AxisInfo::new(
            "Amplitude",
            units,
            AxisScale::Log,
            self.y_min.unwrap_or(default_min),
            self.y_max,
        )
    }

    fn rescale(&mut self, window: ArrayView2<f64>) -> (f64, f64) {
        let output = self.compute(window);
        self.fit(&output)
    }

    fn fit(&mut self, output: &ModeOutput) -> (f64, f64) {
        if let Some((lo, hi)) = finite_range(output.values.iter()) {
            self.y_min = Some(lo);
            self.y_max = hi;
        }
        let y = self.y_axis();
        (y.min, y.max)
    }
}

/// Exponential smoothing of successive power spectra.
#[derive(Default)]
struct Smoother {
    history: Option<Array2<f64>>,
}

impl Smoother {
    fn reset(&mut self) {
        self.history = None;
    }

    /// Blends `amplitude²` into the running power and returns its square
    /// root. The first window (or a shape change) seeds the history.
    fn apply(&mut self, alpha: f64, amplitude: Array2<f64>) -> Array2<f64> {
        let power = amplitude.mapv(|v| v * v);
        match &mut self.history {
            Some(history) if history.dim() == power.dim() => {
                history.zip_mut_with(&power, |h, &p| *h = alpha * p + (1.0 - alpha) * *h);
                history.mapv(f64::sqrt)
            }
            _ => {
                self.history = Some(power);
                amplitude
            }
        }
    }
}

pub struct LogFftMode {
    f_s: f64,
    counts: Vec<usize>,
    axis: Array1<f64>,
    alpha: f64,
    smoother: Smoother,
    y_range: (f64, f64),
}

impl LogFftMode {
    /// Smoothing time constants offered, in updates.
    pub const FILTERS: [usize; 3] = [1, 10, 100];

    fn new(timebase: usize, f_s: f64) -> Self {
        let mut mode = Self {
            f_s,
            counts: Vec::new(),
            axis: Array1::zeros(0),
            alpha: 1.0,
            smoother: Smoother::default(),
            y_range: (1e-3, 100.0),
        };
        mode.set_timebase(timebase, f_s);
        mode
    }

    fn set_timebase(&mut self, timebase: usize, f_s: f64) {
        self.f_s = f_s;
        self.counts = compute_gaps((timebase / 2).saturating_sub(1), LOG_FFT_POINTS);
        self.axis = bucket_frequencies(&self.counts, f_s, timebase);
        self.smoother.reset();
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn smoothing(&self) -> f64 {
        self.alpha
    }

    /// Sets the blend coefficient; 1 disables smoothing. Any change restarts
    /// the running estimate from the next window.
    pub fn set_smoothing(&mut self, alpha: f64) {
        let alpha = alpha.clamp(f64::MIN_POSITIVE, 1.0);
        if alpha != self.alpha {
            self.alpha = alpha;
            self.smoother.reset();
        }
    }

    /// Smoothing over roughly `updates` successive windows.
    pub fn set_filter(&mut self, updates: usize) {
        self.set_smoothing(1.0 / updates.max(1) as f64);
    }

    /// `f · sqrt(mean power per bucket)` without smoothing.
    fn condensed(&self, window: ArrayView2<f64>) -> Array2<f64> {
        let spectrum = scaled_abs_fft(window, self.f_s);
        let power = spectrum.slice(s![1.., ..]).mapv(|v| v * v);
        let mut buckets = condense(power.view(), &self.counts);
        for ((mut row, &count), &freq) in buckets
            .axis_iter_mut(Axis(0))
            .zip(&self.counts)
            .zip(self.axis.iter())
        {
            row.mapv_inplace(|p| freq * (p / count as f64).sqrt());
        }
        buckets
    }

    fn compute(&mut self, window: ArrayView2<f64>) -> ModeOutput {
        let amplitude = self.condensed(window);
        let values = if self.alpha >= 1.0 {
            amplitude
        } else {
            self.smoother.apply(self.alpha, amplitude)
        };
        ModeOutput::plain(self.axis.clone(), values)
    }

    fn x_axis(&self) -> AxisInfo {
        let xmin = self.axis.first().copied().unwrap_or(0.0);
        AxisInfo::new("Frequency", "Hz", AxisScale::Log, xmin, self.f_s / 2.0)
    }

    fn y_axis(&self) -> AxisInfo {
        let (lo, hi) = self.y_range;
        AxisInfo::new("Amplitude × freq", "µm·√Hz", AxisScale::Log, lo, hi)
    }

    fn rescale(&mut self, window: ArrayView2<f64>) -> (f64, f64) {
        let condensed = self.condensed(window);
        self.fit_values(condensed.iter())
    }

    fn fit(&mut self, output: &ModeOutput) -> (f64, f64) {
        self.fit_values(output.values.iter())
    }

    fn fit_values<'a>(&mut self, values: impl IntoIterator<Item = &'a f64>) -> (f64, f64) {
        if let Some(range) = finite_range(values) {
            self.y_range = range;
        }
        self.y_range
    }
}

pub struct IntegratedMode {
    f_s: f64,
    counts: Vec<usize>,
    axis: Array1<f64>,
    background: Option<Array2<f64>>,
    subtract_background: bool,
    linear_y: bool,
    y_range: (f64, f64),
}

impl IntegratedMode {
    fn new(timebase: usize, f_s: f64) -> Self {
        let mut mode = Self {
            f_s,
            counts: Vec::new(),
            axis: Array1::zeros(0),
            background: None,
            subtract_background: false,
            linear_y: false,
            y_range: (1e-3, 10.0),
        };
        mode.set_timebase(timebase, f_s);
        mode
    }

    fn set_timebase(&mut self, timebase: usize, f_s: f64) {
        let counts = compute_gaps((timebase / 2).saturating_sub(1), INTEGRATED_POINTS);
        let axis = bucket_frequencies(&counts, f_s, timebase);
        // A background taken on another bucket table no longer lines up.
        if counts != self.counts || axis != self.axis {
            self.background = None;
        }
        self.f_s = f_s;
        self.counts = counts;
        self.axis = axis;
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// `sqrt(f_s / N · cumsum(condensed power))`: displacement integrated up
    /// to each bucket's upper frequency.
    fn cumulative(&self, window: ArrayView2<f64>) -> Array2<f64> {
        let n = window.nrows().max(1);
        let spectrum = scaled_abs_fft(window, self.f_s);
        let power = spectrum.slice(s![1.., ..]).mapv(|v| v * v);
        let mut sums = condense(power.view(), &self.counts);
        sums.accumulate_axis_inplace(Axis(0), |&prev, curr| *curr += prev);
        let scale = self.f_s / n as f64;
        sums.mapv(|p| (scale * p).sqrt())
    }

    /// Stores the current window's curve as the background.
    pub fn capture_background(&mut self, window: ArrayView2<f64>) {
        self.background = Some(self.cumulative(window));
    }

    pub fn clear_background(&mut self) {
        self.background = None;
    }

    pub fn background(&self) -> Option<&Array2<f64>> {
        self.background.as_ref()
    }

    /// When set, the background's integrated power is removed from each
    /// curve before taking the square root, clamped at zero.
    pub fn set_subtract_background(&mut self, subtract: bool) {
        self.subtract_background = subtract;
    }

    pub fn set_linear_y(&mut self, linear: bool) {
        self.linear_y = linear;
    }

    fn compute(&self, window: ArrayView2<f64>) -> ModeOutput {
        let mut values = self.cumulative(window);
        if self.subtract_background {
            if let Some(background) = self.background.as_ref().filter(|b| b.dim() == values.dim()) {
                values.zip_mut_with(background, |v, &b| *v = (*v * *v - b * b).max(0.0).sqrt());
            }
        }
        ModeOutput {
            axis: self.axis.clone(),
            values,
            envelope: None,
            background: self.background.clone(),
        }
    }

    fn x_axis(&self) -> AxisInfo {
        let xmin = self.axis.first().copied().unwrap_or(0.0);
        AxisInfo::new("Frequency", "Hz", AxisScale::Log, xmin, self.f_s / 2.0)
    }

    fn y_axis(&self) -> AxisInfo {
        let scale = if self.linear_y {
            AxisScale::Linear
        } else {
            AxisScale::Log
        };
        let (lo, hi) = self.y_range;
        AxisInfo::new("Cumulative amplitude", MICROMETRE, scale, lo, hi)
    }

    fn rescale(&mut self, window: ArrayView2<f64>) -> (f64, f64) {
        let output = self.compute(window);
        self.fit(&output)
    }

    fn fit(&mut self, output: &ModeOutput) -> (f64, f64) {
        if let Some(range) = finite_range(output.values.iter()) {
            self.y_range = range;
        }
        self.y_range
    }
}

/// One of the four display transforms with its per-mode state.
pub enum DisplayMode {
    Raw(RawMode),
    Fft(FftMode),
    FftLogF(LogFftMode),
    Integrated(IntegratedMode),
}

impl DisplayMode {
    pub fn new(kind: ModeKind, timebase: usize, f_s: f64) -> Self {
        match kind {
            ModeKind::Raw => DisplayMode::Raw(RawMode::new(timebase, f_s)),
            ModeKind::Fft => DisplayMode::Fft(FftMode::new(timebase, f_s)),
            ModeKind::FftLogF => DisplayMode::FftLogF(LogFftMode::new(timebase, f_s)),
            ModeKind::Integrated => DisplayMode::Integrated(IntegratedMode::new(timebase, f_s)),
        }
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            DisplayMode::Raw(_) => ModeKind::Raw,
            DisplayMode::Fft(_) => ModeKind::Fft,
            DisplayMode::FftLogF(_) => ModeKind::FftLogF,
            DisplayMode::Integrated(_) => ModeKind::Integrated,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Recomputes axes for a new window length. Smoothing history is
    /// discarded; a stored background only when the bucket table changes.
    pub fn set_timebase(&mut self, timebase: usize, f_s: f64) {
        match self {
            DisplayMode::Raw(m) => m.set_timebase(timebase, f_s),
            DisplayMode::Fft(m) => m.set_timebase(timebase, f_s),
            DisplayMode::FftLogF(m) => m.set_timebase(timebase, f_s),
            DisplayMode::Integrated(m) => m.set_timebase(timebase, f_s),
        }
    }

    /// Transforms a window of `timebase` samples.
    pub fn compute(&mut self, window: ArrayView2<f64>) -> ModeOutput {
        match self {
            DisplayMode::Raw(m) => m.compute(window),
            DisplayMode::Fft(m) => m.compute(window),
            DisplayMode::FftLogF(m) => m.compute(window),
            DisplayMode::Integrated(m) => m.compute(window),
        }
    }

    pub fn x_axis(&self) -> AxisInfo {
        match self {
            DisplayMode::Raw(m) => m.x_axis(),
            DisplayMode::Fft(m) => m.x_axis(),
            DisplayMode::FftLogF(m) => m.x_axis(),
            DisplayMode::Integrated(m) => m.x_axis(),
        }
    }

    pub fn y_axis(&self) -> AxisInfo {
        match self {
            DisplayMode::Raw(m) => m.y_axis(),
            DisplayMode::Fft(m) => m.y_axis(),
            DisplayMode::FftLogF(m) => m.y_axis(),
            DisplayMode::Integrated(m) => m.y_axis(),
        }
    }

    /// Fits the y axis to the window and returns the new `(min, max)`. Raw
    /// mode adds a margin; the log scaled modes use the exact range.
    pub fn rescale(&mut self, window: ArrayView2<f64>) -> (f64, f64) {
        match self {
            DisplayMode::Raw(m) => m.rescale(window),
            DisplayMode::Fft(m) => m.rescale(window),
            DisplayMode::FftLogF(m) => m.rescale(window),
            DisplayMode::Integrated(m) => m.rescale(window),
        }
    }

    /// Fits the y axis to an output this mode already computed, without
    /// transforming the window again.
    pub fn fit(&mut self, output: &ModeOutput) -> (f64, f64) {
        match self {
            DisplayMode::Raw(m) => m.fit(output),
            DisplayMode::Fft(m) => m.fit(output),
            DisplayMode::FftLogF(m) => m.fit(output),
            DisplayMode::Integrated(m) => m.fit(output),
        }
    }
}
