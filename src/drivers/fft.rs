use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rustfft::{num_complex::Complex64, FftPlanner};

/// Magnitude of the non-negative half of the spectrum of each column,
/// scaled to units per √Hz: `|X_k| · sqrt(2 / (f_s · N))`.
///
/// Returns `N / 2` rows; row 0 is the DC bin.
pub fn scaled_abs_fft(window: ArrayView2<f64>, f_s: f64) -> Array2<f64> {
    let n = window.nrows();
    let half = n / 2;
    let mut out = Array2::zeros((half, window.ncols()));
    if n == 0 {
        return out;
    }
    let scale = (2.0 / (f_s * n as f64)).sqrt();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer = vec![Complex64::new(0.0, 0.0); n];
    for (column, mut target) in window.axis_iter(Axis(1)).zip(out.axis_iter_mut(Axis(1))) {
        for (slot, &v) in buffer.iter_mut().zip(column.iter()) {
            *slot = Complex64::new(v, 0.0);
        }
        fft.process(&mut buffer);
        for (dst, c) in target.iter_mut().zip(&buffer[..half]) {
            *dst = c.norm() * scale;
        }
    }
    out
}

/// Averaged spectrum: the window is cut into `decimation` consecutive
/// segments and the RMS of their scaled spectra is reported. Rows past a
/// whole number of segments are ignored.
pub fn decimated_fft(window: ArrayView2<f64>, f_s: f64, decimation: usize) -> Array2<f64> {
    if decimation <= 1 {
        return scaled_abs_fft(window, f_s);
    }
    let segment = window.nrows() / decimation;
    let mut power = Array2::<f64>::zeros((segment / 2, window.ncols()));
    for i in 0..decimation {
        let part = window.slice(s![i * segment..(i + 1) * segment, ..]);
        let spectrum = scaled_abs_fft(part, f_s);
        power += &spectrum.mapv(|v| v * v);
    }
    power.mapv(|p| (p / decimation as f64).sqrt())
}

/// Logarithmically widening bucket sizes covering an array of length `len`.
///
/// `points` log-spaced break points are laid over `1..=len` and their
/// positive differences kept, so the result may be shorter than `points`.
/// The counts sum to at most `len - 1`.
pub fn compute_gaps(len: usize, points: usize) -> Vec<usize> {
    if len < 2 || points < 2 {
        return Vec::new();
    }
    let top = (len as f64).log10();
    let steps = (points - 1) as f64;
    let mut last = 1usize;
    let mut counts = Vec::new();
    for i in 1..points {
        let gap = (10f64.powf(top * i as f64 / steps) as usize).min(len);
        if gap > last {
            counts.push(gap - last);
            last = gap;
        }
    }
    counts
}

/// Sums consecutive runs of rows, one run per entry of `counts`.
///
/// Always returns `counts.len()` rows; runs that fall past the end of
/// `values` sum only what is there.
pub fn condense(values: ArrayView2<f64>, counts: &[usize]) -> Array2<f64> {
    let rows = values.nrows();
    let mut sums = Array2::zeros((counts.len(), values.ncols()));
    let mut left = 0;
    for (mut row, &step) in sums.axis_iter_mut(Axis(0)).zip(counts) {
        let lo = left.min(rows);
        let hi = (left + step).min(rows);
        row.assign(&values.slice(s![lo..hi, ..]).sum_axis(Axis(0)));
        left += step;
    }
    sums
}

/// Frequency of the upper edge of each bucket, `f_s · cumsum(counts) / n`.
pub fn bucket_frequencies(counts: &[usize], f_s: f64, n: usize) -> Array1<f64> {
    let mut total = 0usize;
    counts
        .iter()
        .map(|&c| {
            total += c;
            f_s * total as f64 / n as f64
        })
        .collect()
}

/// Linear frequency axis for an FFT of `n` points, `scale · f_s · k / n`.
pub fn fft_axis(n: usize, f_s: f64, scale: f64) -> Array1<f64> {
    (0..n / 2)
        .map(|k| scale * f_s * k as f64 / n as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use std::f64::consts::PI;

    fn sinusoid(n: usize, f_s: f64, f0: f64, amplitude: f64) -> Array2<f64> {
        Array::from_shape_fn((n, 2), |(i, c)| {
            let t = i as f64 / f_s;
            let a = if c == 0 { amplitude } else { amplitude / 2.0 };
            a * (2.0 * PI * f0 * t).sin()
        })
    }

    #[test]
    fn sinusoid_peak_in_density_units() {
        let (n, f_s) = (1000, 10_000.0);
        let f0 = 50.0 * f_s / n as f64; // exactly bin 50
        let spectrum = scaled_abs_fft(sinusoid(n, f_s, f0, 3.0).view(), f_s);
        assert_eq!(spectrum.nrows(), n / 2);
        let peak = spectrum
            .column(0)
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (k, &v)| if v > best.1 { (k, v) } else { best });
        assert_eq!(peak.0, 50);
        let expected = 3.0 * n as f64 / 2.0 * (2.0 / (f_s * n as f64)).sqrt();
        assert!((peak.1 - expected).abs() < 1e-9 * expected.max(1.0));
        assert!((spectrum[[50, 1]] - expected / 2.0).abs() < 1e-9);
    }

    #[test]
    fn decimation_by_one_is_exact() {
        let window = sinusoid(512, 1000.0, 37.0, 1.0);
        assert_eq!(
            decimated_fft(window.view(), 1000.0, 1),
            scaled_abs_fft(window.view(), 1000.0)
        );
    }

    #[test]
    fn decimated_spectrum_has_segment_resolution() {
        let window = sinusoid(1000, 1000.0, 100.0, 1.0);
        let spectrum = decimated_fft(window.view(), 1000.0, 10);
        assert_eq!(spectrum.dim(), (50, 2));
        // 100 Hz falls on bin 10 of each 100 point segment.
        let column = spectrum.column(0);
        let max = column.iter().cloned().fold(f64::MIN, f64::max);
        assert_eq!(column[10], max);
    }

    #[test]
    fn gaps_never_exceed_length() {
        for &(len, points) in &[(499usize, 1000usize), (4999, 1000), (4999, 5000), (10, 3)] {
            let counts = compute_gaps(len, points);
            assert!(!counts.is_empty());
            assert!(counts.iter().all(|&c| c > 0));
            assert!(counts.iter().sum::<usize>() <= len);
            assert!(counts.len() < points);
        }
        assert!(compute_gaps(1, 100).is_empty());
    }

    #[test]
    fn condense_row_count_matches_table() {
        let values = Array2::from_elem((20, 2), 1.0);
        let counts = [1, 2, 3, 4];
        let sums = condense(values.view(), &counts);
        assert_eq!(sums.nrows(), 4);
        assert_eq!(sums.column(0).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        // A table running off the end still yields one row per bucket.
        let short = Array2::from_elem((5, 2), 1.0);
        let sums = condense(short.view(), &counts);
        assert_eq!(sums.nrows(), 4);
        assert_eq!(sums.column(1).to_vec(), vec![1.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn axes_scale_with_sample_rate() {
        let axis = fft_axis(8, 1000.0, 1e-3);
        assert_eq!(axis.len(), 4);
        assert!((axis[1] - 0.125).abs() < 1e-12);
        let freq = bucket_frequencies(&[1, 2, 4], 1000.0, 100);
        assert_eq!(freq.to_vec(), vec![10.0, 30.0, 70.0]);
    }
}
