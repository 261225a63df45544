//! Client-side validation of job operation parameters.
//!
//! A `preset` fills in per-operation defaults that explicit parameters
//! override. Known operations get their parameters coerced and range-checked
//! so that bad input is rejected before anything is sent to the backend.

use serde_json::{Map, Number, Value};

use crate::error::JobError;

pub const PRESETS: [&str; 2] = ["forensic_safe", "presentation"];
pub const UPSCALE_FACTORS: [u64; 3] = [2, 4, 8];
pub const DENOISE_LEVELS: [&str; 3] = ["light", "medium", "heavy"];

fn preset_defaults(preset: &str, operation: &str) -> Map<String, Value> {
    let mut defaults = Map::new();
    match (preset, operation) {
        ("forensic_safe", "denoise") => {
            defaults.insert("level".into(), "light".into());
        }
        ("forensic_safe", "upscale") => {
            defaults.insert("factor".into(), 2.into());
        }
        ("presentation", "denoise") => {
            defaults.insert("level".into(), "medium".into());
        }
        ("presentation", "upscale") => {
            defaults.insert("factor".into(), 8.into());
        }
        _ => {}
    }
    defaults
}

/// Normalize `operation` and its `params`. Returns the lower-cased operation
/// name and the parameters as they should be submitted.
pub fn normalize_params(
    operation: &str,
    params: &Map<String, Value>,
) -> Result<(String, Map<String, Value>), JobError> {
    let operation = operation.trim().to_lowercase();
    if operation.is_empty() {
        return Err(JobError::InvalidParams("operation must not be empty".into()));
    }

    let mut payload = params.clone();
    if let Some(raw) = payload.remove("preset") {
        let preset = value_as_text(&raw).trim().to_lowercase();
        if !PRESETS.contains(&preset.as_str()) {
            return Err(JobError::InvalidParams(format!(
                "preset must be one of {}",
                PRESETS.join(", ")
            )));
        }
        let mut merged = preset_defaults(&preset, &operation);
        merged.extend(payload);
        merged.insert("preset".into(), Value::String(preset));
        payload = merged;
    }

    match operation.as_str() {
        "upscale" => {
            let factor = match payload.get("factor") {
                None => 2,
                Some(raw) => as_integer(raw)
                    .and_then(|factor| u64::try_from(factor).ok())
                    .filter(|factor| UPSCALE_FACTORS.contains(factor))
                    .ok_or_else(|| JobError::InvalidParams("factor must be one of 2, 4, 8".into()))?,
            };
            payload.insert("factor".into(), factor.into());
        }
        "denoise" => {
            let level = payload
                .get("level")
                .map(|raw| value_as_text(raw).trim().to_lowercase())
                .unwrap_or_else(|| "medium".to_string());
            if !DENOISE_LEVELS.contains(&level.as_str()) {
                return Err(JobError::InvalidParams(
                    "level must be one of light, medium, heavy".into(),
                ));
            }
            payload.insert("level".into(), Value::String(level));
        }
        "detect_objects" => {
            if let Some(raw) = payload.get("scene_threshold") {
                let threshold = as_float(raw).ok_or_else(|| {
                    JobError::InvalidParams("scene_threshold must be numeric".into())
                })?;
                if !(0.0..=100.0).contains(&threshold) {
                    return Err(JobError::InvalidParams(
                        "scene_threshold must be between 0 and 100".into(),
                    ));
                }
                let number = Number::from_f64(threshold).ok_or_else(|| {
                    JobError::InvalidParams("scene_threshold must be numeric".into())
                })?;
                payload.insert("scene_threshold".into(), Value::Number(number));
            }
            if let Some(raw) = payload.get("temporal_window") {
                let window = as_integer(raw).ok_or_else(|| {
                    JobError::InvalidParams("temporal_window must be an integer".into())
                })?;
                if !(1..=12).contains(&window) {
                    return Err(JobError::InvalidParams(
                        "temporal_window must be between 1 and 12".into(),
                    ));
                }
                payload.insert("temporal_window".into(), window.into());
            }
        }
        _ => {}
    }

    Ok((operation, payload))
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Integers, integral floats and numeric strings.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    let float = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    float.filter(|float| float.is_finite())
}
