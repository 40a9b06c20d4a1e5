//! Closed-form estimates and least-squares fits of bin current traces.
//!
//! Two models are supported:
//!
//! - **Linear** `y = m*x + b`. The initial guess comes from the means of
//!   the two halves of the series; one Gauss-Newton step from that guess
//!   lands on the least-squares solution.
//! - **Exponential decay** `y = a*exp(-b*x) + c`. The series is split into
//!   thirds whose mean points give a closed-form `(a, b, c)` assuming equal
//!   spacing of the three points. That estimate seeds a Levenberg-Marquardt
//!   refinement over every point.
//!
//! The three-point estimate divides by the spacing of the *outer* points;
//! when the representative points are unevenly spaced it is only an
//! approximation. The spacing check can be disabled through
//! [`ExponentialOptions::spacing_override`], in which case the same formula
//! is applied regardless.

use crate::data::Bin;
use crate::error::{AppResult, DaqError};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Model family of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FitModel {
    /// `a*exp(-b*x) + c`, parameters `[a, b, c]`
    Exponential,
    /// `m*x + b`, parameters `[m, b]`
    Linear,
}

impl FitModel {
    /// Evaluate the model at `x`. Missing parameters read as 0.
    pub fn evaluate(self, params: &[f64], x: f64) -> f64 {
        let p = |i: usize| params.get(i).copied().unwrap_or(0.0);
        match self {
            Self::Exponential => p(0) * (-p(1) * x).exp() + p(2),
            Self::Linear => p(0) * x + p(1),
        }
    }
}

impl fmt::Display for FitModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => f.write_str("exponential"),
            Self::Linear => f.write_str("linear"),
        }
    }
}

impl FromStr for FitModel {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exp" | "exponential" => Ok(Self::Exponential),
            "lin" | "linear" => Ok(Self::Linear),
            other => Err(DaqError::invalid(format!("Unknown fit model '{}'", other))),
        }
    }
}

/// Fitted parameters and the x-range of the data they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    /// Model the parameters belong to
    pub model: FitModel,
    /// Parameters in the order listed on [`FitModel`]
    pub parameters: Vec<f64>,
    /// First and last x value of the fitted data
    pub source_interval: (f64, f64),
}

impl FitResult {
    /// Evaluate the fitted curve at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.model.evaluate(&self.parameters, x)
    }
}

/// Exponential fit with its intermediate estimates.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialFit {
    /// Refined `[a, b, c]`
    pub result: FitResult,
    /// Closed-form `[a, b, c]` from the three representative points
    pub initial_guess: [f64; 3],
    /// Mean `(x, y)` of each third
    pub representative_points: [(f64, f64); 3],
}

/// Tuning for the exponential fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialOptions {
    /// Skip the equal-spacing check of the three representative points
    pub spacing_override: bool,
    /// Absolute tolerance of the spacing check
    pub spacing_tolerance: f64,
}

impl Default for ExponentialOptions {
    fn default() -> Self {
        Self {
            spacing_override: true,
            spacing_tolerance: 1e-6,
        }
    }
}

/// Monotonic trend of three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    /// `y1 < y2 < y3`
    Increasing,
    /// `y1 > y2 > y3`
    Decreasing,
}

/// Strict monotonicity of `y1, y2, y3`, if any.
pub fn is_ordered(y1: f64, y2: f64, y3: f64) -> Option<Trend> {
    if y1 > y2 && y2 > y3 {
        Some(Trend::Decreasing)
    } else if y1 < y2 && y2 < y3 {
        Some(Trend::Increasing)
    } else {
        None
    }
}

/// Split indices `(m1, m2)` cutting `n` items into thirds
/// `[..m1]`, `[m1..m2]`, `[m2..]`.
pub fn third_markers(n: usize) -> (usize, usize) {
    let k = n / 3;
    match n % 3 {
        0 => (k, 2 * k),
        1 => (k, 2 * k + 1),
        _ => (k + 1, 2 * k + 1),
    }
}

fn check_lengths(x: &[f64], y: &[f64]) -> AppResult<()> {
    if x.len() != y.len() {
        return Err(DaqError::invalid(format!(
            "x has {} points but y has {}",
            x.len(),
            y.len()
        )));
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn interval(x: &[f64]) -> (f64, f64) {
    match (x.first(), x.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => (f64::NAN, f64::NAN),
    }
}

// ============================================================================
// Linear
// ============================================================================

/// Least-squares line through `(x, y)`; parameters `[m, b]`.
pub fn fit_linear(x: &[f64], y: &[f64]) -> AppResult<FitResult> {
    check_lengths(x, y)?;
    let n = x.len();
    if n < 2 {
        return Err(DaqError::invalid(format!(
            "Linear fit needs at least 2 points, found {}",
            n
        )));
    }

    let half = n / 2;
    let (x1, y1) = (mean(&x[..half]), mean(&y[..half]));
    let (x2, y2) = (mean(&x[half..]), mean(&y[half..]));
    let m_guess = (y1 - y2) / (x1 - x2);
    let b_guess = y1 - m_guess * x1;
    if !(m_guess.is_finite() && b_guess.is_finite()) {
        return Err(DaqError::invalid(
            "Linear fit is degenerate: the two halves share one x position",
        ));
    }

    // Gauss-Newton: J = [x, 1], residual r = y - (m x + b)
    let mut jtj = Matrix2::<f64>::zeros();
    let mut jtr = Vector2::<f64>::zeros();
    for (&xi, &yi) in x.iter().zip(y) {
        let j = Vector2::new(xi, 1.0);
        let r = yi - (m_guess * xi + b_guess);
        jtj += j * j.transpose();
        jtr += j * r;
    }
    let delta = jtj
        .lu()
        .solve(&jtr)
        .ok_or_else(|| DaqError::invalid("Linear fit is degenerate: singular normal matrix"))?;

    Ok(FitResult {
        model: FitModel::Linear,
        parameters: vec![m_guess + delta[0], b_guess + delta[1]],
        source_interval: interval(x),
    })
}

// ============================================================================
// Exponential
// ============================================================================

/// Closed-form `[a, b, c]` through three points assumed equally spaced in x.
pub fn exponential_estimate(
    p1: (f64, f64),
    p2: (f64, f64),
    p3: (f64, f64),
    options: &ExponentialOptions,
) -> AppResult<[f64; 3]> {
    let ((x1, y1), (x2, y2), (x3, y3)) = (p1, p2, p3);

    if !options.spacing_override && ((x2 - x1) - (x3 - x2)).abs() > options.spacing_tolerance {
        return Err(DaqError::invalid(format!(
            "Representative points are not equally spaced ({} vs {})",
            x2 - x1,
            x3 - x2
        )));
    }
    if is_ordered(y1, y2, y3).is_none() {
        return Err(DaqError::invalid(format!(
            "Averaged currents are not ordered: {}, {}, {}",
            y1, y2, y3
        )));
    }

    let dx = (x3 - x1) / 2.0;
    let b = ((y1 - y2) / (y2 - y3)).ln() / dx;
    let a = (y1 - y2) / ((-b * x1).exp() - (-b * x2).exp());
    let c = y1 - a * (-b * x1).exp();

    if !(a.is_finite() && b.is_finite() && c.is_finite()) {
        return Err(DaqError::invalid(format!(
            "Three-point estimate is degenerate (a={}, b={}, c={})",
            a, b, c
        )));
    }
    Ok([a, b, c])
}

const LM_MAX_ITERATIONS: usize = 200;
const LM_RELATIVE_TOLERANCE: f64 = 1e-12;

fn sum_squares(x: &[f64], y: &[f64], p: &Vector3<f64>) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi - (p[0] * (-p[1] * xi).exp() + p[2]);
            r * r
        })
        .sum()
}

/// Levenberg-Marquardt refinement of `a*exp(-b*x) + c` from `start`.
fn refine_exponential(x: &[f64], y: &[f64], start: [f64; 3]) -> [f64; 3] {
    let mut p = Vector3::from(start);
    let mut cost = sum_squares(x, y, &p);
    let mut lambda = 1e-3;

    for iteration in 0..LM_MAX_ITERATIONS {
        if cost == 0.0 {
            break;
        }

        let mut jtj = Matrix3::<f64>::zeros();
        let mut jtr = Vector3::<f64>::zeros();
        for (&xi, &yi) in x.iter().zip(y) {
            let e = (-p[1] * xi).exp();
            let j = Vector3::new(e, -p[0] * xi * e, 1.0);
            let r = yi - (p[0] * e + p[2]);
            jtj += j * j.transpose();
            jtr += j * r;
        }

        // Solve in column-normalized variables; a, b and c differ by many
        // orders of magnitude when currents are in amps.
        let scale = Vector3::from_fn(|i, _| jtj[(i, i)].sqrt().max(f64::MIN_POSITIVE));
        let normalized = Matrix3::from_fn(|i, j| jtj[(i, j)] / (scale[i] * scale[j]));
        let rhs = jtr.component_div(&scale);

        let mut improved = false;
        while lambda < 1e12 {
            let damped = normalized + Matrix3::identity() * lambda;
            let Some(step) = damped.lu().solve(&rhs) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = p + step.component_div(&scale);
            let candidate_cost = sum_squares(x, y, &candidate);
            if candidate_cost.is_finite() && candidate_cost < cost {
                let gain = (cost - candidate_cost) / cost;
                p = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                improved = gain > LM_RELATIVE_TOLERANCE;
                break;
            }
            lambda *= 10.0;
        }

        if !improved {
            debug!("Exponential refinement converged after {} iterations", iteration);
            break;
        }
    }
    [p[0], p[1], p[2]]
}

/// Fit `a*exp(-b*x) + c` to `(x, y)`.
///
/// Fails with `InvalidArgument` when fewer than 3 points are given, the
/// averaged thirds are not strictly monotonic, or the closed-form decay
/// rate is negative (a diverging exponential).
pub fn fit_exponential(
    x: &[f64],
    y: &[f64],
    options: &ExponentialOptions,
) -> AppResult<ExponentialFit> {
    check_lengths(x, y)?;
    let n = x.len();
    if n < 3 {
        return Err(DaqError::invalid(format!(
            "Exponential fit needs at least 3 points, found {}",
            n
        )));
    }

    let (m1, m2) = third_markers(n);
    let third = |range: std::ops::Range<usize>| (mean(&x[range.clone()]), mean(&y[range]));
    let points = [third(0..m1), third(m1..m2), third(m2..n)];

    let guess = exponential_estimate(points[0], points[1], points[2], options)?;
    if guess[1] < 0.0 {
        return Err(DaqError::invalid(format!(
            "Diverging exponential found (b = {})",
            guess[1]
        )));
    }

    let refined = refine_exponential(x, y, guess);
    debug!("Exponential fit: guess {:?}, refined {:?}", guess, refined);

    Ok(ExponentialFit {
        result: FitResult {
            model: FitModel::Exponential,
            parameters: refined.to_vec(),
            source_interval: interval(x),
        },
        initial_guess: guess,
        representative_points: points,
    })
}

// ============================================================================
// Bin fits
// ============================================================================

/// Linear fit of current against elapsed time.
pub fn fit_bin_linear(bin: &Bin) -> AppResult<FitResult> {
    fit_linear(&bin.times(), &bin.currents())
}

/// Exponential fit of current against elapsed time.
pub fn fit_bin_exponential(bin: &Bin, options: &ExponentialOptions) -> AppResult<ExponentialFit> {
    fit_exponential(&bin.times(), &bin.currents(), options)
}

/// Linear fit of the samples with `t_start <= t < t_stop`.
///
/// Sample times must be sorted. Also returns whether the window reached the
/// end of the bin, so callers sweeping `t_stop` know when to stop.
pub fn timed_linear_fit(bin: &Bin, t_start: f64, t_stop: f64) -> AppResult<(FitResult, bool)> {
    let times = bin.times();
    let start = times.partition_point(|&t| t < t_start);
    let stop = times.partition_point(|&t| t < t_stop).max(start);
    let currents = bin.currents();

    let fit = fit_linear(&times[start..stop], &currents[start..stop])?;
    Ok((fit, stop == times.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Direction, Sample};
    use approx::assert_relative_eq;

    fn decay(n: usize, a: f64, b: f64, c: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.5).collect();
        let y = x
            .iter()
            .enumerate()
            .map(|(i, &t)| a * (-b * t).exp() + c + 1e-9 * ((i as f64) * 1.7).sin())
            .collect();
        (x, y)
    }

    #[test]
    fn test_third_markers() {
        assert_eq!(third_markers(9), (3, 6));
        assert_eq!(third_markers(10), (3, 7));
        assert_eq!(third_markers(11), (4, 7));
    }

    #[test]
    fn test_is_ordered() {
        assert_eq!(is_ordered(3.0, 2.0, 1.0), Some(Trend::Decreasing));
        assert_eq!(is_ordered(1.0, 2.0, 3.0), Some(Trend::Increasing));
        assert_eq!(is_ordered(1.0, 1.0, 3.0), None);
        assert_eq!(is_ordered(1.0, 3.0, 2.0), None);
    }

    #[test]
    fn test_linear_exact() {
        let x: Vec<f64> = (0..6).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v + 1.0).collect();
        let fit = fit_linear(&x, &y).unwrap();
        assert_relative_eq!(fit.parameters[0], 3.0, epsilon = 1e-10);
        assert_relative_eq!(fit.parameters[1], 1.0, epsilon = 1e-10);
        assert_eq!(fit.source_interval, (0.0, 5.0));
        assert_relative_eq!(fit.evaluate(10.0), 31.0, epsilon = 1e-9);
    }

    #[test]
    fn test_linear_least_squares_on_noisy_points() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 2.0, 2.0, 4.0];
        let fit = fit_linear(&x, &y).unwrap();
        // slope = cov(x,y)/var(x) = 4.5/5
        assert_relative_eq!(fit.parameters[0], 0.9, epsilon = 1e-12);
        assert_relative_eq!(fit.parameters[1], 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_rejects_degenerate_input() {
        assert!(matches!(fit_linear(&[1.0], &[2.0]), Err(DaqError::InvalidArgument(_))));
        assert!(matches!(
            fit_linear(&[2.0, 2.0], &[1.0, 3.0]),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(fit_linear(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn test_exponential_recovers_parameters() {
        let (x, y) = decay(60, 2.0, 0.1, 0.5);
        let fit = fit_exponential(&x, &y, &ExponentialOptions::default()).unwrap();

        assert!(fit.initial_guess[1] > 0.0);
        let p = &fit.result.parameters;
        assert_relative_eq!(p[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(p[1], 0.1, epsilon = 1e-4);
        assert_relative_eq!(p[2], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_exponential_rejects_unordered_triad() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 1.0, 3.0, 3.0, 2.0, 2.0];
        let err = fit_exponential(&x, &y, &ExponentialOptions::default()).unwrap_err();
        assert!(matches!(err, DaqError::InvalidArgument(_)));
        assert!(err.to_string().contains("not ordered"));
    }

    #[test]
    fn test_exponential_rejects_diverging_data() {
        let x: Vec<f64> = (0..9).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|t| (0.3 * t).exp()).collect();
        let err = fit_exponential(&x, &y, &ExponentialOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Diverging"));
    }

    #[test]
    fn test_spacing_check_only_without_override() {
        let p1 = (0.0, 3.0);
        let p2 = (1.0, 2.0);
        let p3 = (5.0, 1.5);
        let strict = ExponentialOptions {
            spacing_override: false,
            ..ExponentialOptions::default()
        };
        assert!(exponential_estimate(p1, p2, p3, &strict).is_err());
        assert!(exponential_estimate(p1, p2, p3, &ExponentialOptions::default()).is_ok());
    }

    #[test]
    fn test_timed_linear_fit_window() {
        let samples = (0..10)
            .map(|i| Sample::new(i as f64, 5.0, 2.0 * i as f64 - 1.0))
            .collect();
        let bin = Bin::new(5, Direction::Ascending, samples);

        let (fit, reached_end) = timed_linear_fit(&bin, 2.0, 6.0).unwrap();
        assert!(!reached_end);
        assert_eq!(fit.source_interval, (2.0, 5.0));
        assert_relative_eq!(fit.parameters[0], 2.0, epsilon = 1e-10);

        let (_, reached_end) = timed_linear_fit(&bin, 2.0, 100.0).unwrap();
        assert!(reached_end);

        assert!(timed_linear_fit(&bin, 20.0, 30.0).is_err());
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!("exp".parse::<FitModel>().unwrap(), FitModel::Exponential);
        assert_eq!("Linear".parse::<FitModel>().unwrap(), FitModel::Linear);
        assert!("poly".parse::<FitModel>().is_err());
    }
}
