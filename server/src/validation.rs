use tts_core::PipelineError;

use crate::error::ApiError;

/// Supported range for a requested output sample rate
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 48_000;

/// Validate a synthesis request before any work starts.
///
/// Text with nothing to speak is refused as `empty_input`, the same
/// category segmentation reports for it.
pub fn validate_speech_request(
    text: &str,
    sample_rate: Option<u32>,
    speed: Option<f32>,
    max_text_length: usize,
) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(PipelineError::EmptyInput.into());
    }
    let chars = text.chars().count();
    if chars > max_text_length {
        return Err(ApiError::InvalidInput(format!(
            "Text too long ({} characters, max {})",
            chars, max_text_length
        )));
    }

    if let Some(rate) = sample_rate {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
            return Err(ApiError::InvalidInput(format!(
                "Unsupported sample rate {}. Expected {}..={}",
                rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
    }

    // Out-of-range speed is clamped later; only nonsense is refused.
    if let Some(speed) = speed {
        if !speed.is_finite() {
            return Err(ApiError::InvalidInput(format!("Invalid speed: {}", speed)));
        }
    }

    Ok(())
}
