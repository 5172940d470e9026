//! Raw-to-calibrated value transforms.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    Offset,
    Scale,
    Linear,
    Polynomial,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInfo {
    pub method: Option<CalibrationMethod>,
    pub offset: Option<f64>,
    pub scale: Option<f64>,
    /// `coefficients[i]` multiplies `x^i`.
    #[serde(default)]
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub points: Vec<CalibrationPoint>,
    pub reference_temp: Option<f64>,
    pub temp_coefficient: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("calibration method is not set")]
    MethodUnset,
    #[error("calibration parameter `{0}` is missing")]
    MissingParameter(&'static str),
    #[error("manual calibration needs at least two points, got {0}")]
    InsufficientPoints(usize),
    #[error("manual calibration points share input {0}")]
    DuplicatePoint(f64),
    #[error("calibration produced a non-finite value")]
    NonFinite,
}

/// Applies the sensor's calibration to a raw value.
pub fn apply(raw: f64, info: &CalibrationInfo) -> Result<f64, CalibrationError> {
    if !raw.is_finite() {
        return Err(CalibrationError::NonFinite);
    }

    let method = info.method.ok_or(CalibrationError::MethodUnset)?;
    let value = match method {
        CalibrationMethod::Offset => raw + require(info.offset, "offset")?,
        CalibrationMethod::Scale => raw * require(info.scale, "scale")?,
        CalibrationMethod::Linear => {
            require(info.scale, "scale")? * raw + require(info.offset, "offset")?
        }
        CalibrationMethod::Polynomial => polynomial(raw, &info.coefficients)?,
        CalibrationMethod::Manual => piecewise_linear(raw, &info.points)?,
    };

    finite(value)
}

/// Like [`apply`], then corrects for the ambient temperature when the
/// calibration carries a reference temperature and coefficient.
pub fn apply_compensated(
    raw: f64,
    info: &CalibrationInfo,
    ambient_temp: Option<f64>,
) -> Result<f64, CalibrationError> {
    let value = apply(raw, info)?;
    match (info.reference_temp, info.temp_coefficient, ambient_temp) {
        (Some(reference), Some(coefficient), Some(ambient)) => {
            finite(value + coefficient * (ambient - reference))
        }
        _ => Ok(value),
    }
}

fn require(param: Option<f64>, name: &'static str) -> Result<f64, CalibrationError> {
    param.ok_or(CalibrationError::MissingParameter(name))
}

fn finite(value: f64) -> Result<f64, CalibrationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalibrationError::NonFinite)
    }
}

fn polynomial(x: f64, coefficients: &[f64]) -> Result<f64, CalibrationError> {
    if coefficients.is_empty() {
        return Err(CalibrationError::MissingParameter("coefficients"));
    }
    // Horner's scheme from the highest power down.
    Ok(coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c))
}

fn piecewise_linear(x: f64, points: &[CalibrationPoint]) -> Result<f64, CalibrationError> {
    if points.len() < 2 {
        return Err(CalibrationError::InsufficientPoints(points.len()));
    }

    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.input.total_cmp(&b.input));
    if let Some(pair) = sorted.windows(2).find(|w| w[0].input == w[1].input) {
        return Err(CalibrationError::DuplicatePoint(pair[0].input));
    }

    // Outside the covered range the nearest segment is extended.
    let segment = sorted
        .windows(2)
        .position(|w| x <= w[1].input)
        .unwrap_or(sorted.len() - 2);
    let (lo, hi) = (sorted[segment], sorted[segment + 1]);

    let slope = (hi.output - lo.output) / (hi.input - lo.input);
    Ok(lo.output + slope * (x - lo.input))
}
