//! Curve fitting of bin current traces.

pub mod fit;

pub use fit::{
    exponential_estimate, fit_bin_exponential, fit_bin_linear, fit_exponential, fit_linear,
    is_ordered, third_markers, timed_linear_fit, ExponentialFit, ExponentialOptions, FitModel,
    FitResult, Trend,
};
