// Configuration for the speech server, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tts_core::{EncoderSpec, PipelineConfig, DEFAULT_SEGMENT_LIMIT};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub model_config: Option<PathBuf>,
    pub sample_rate: u32,
    pub speed: f32,
    pub segment_limit: usize,
    pub trim_silence: bool,
    pub unit_timeout_secs: u64,
    pub encoder_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub encoder: String,
    pub encoder_args: Option<Vec<String>>,
    pub mp3_bitrate: String,
    pub max_text_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            model_config: None,
            sample_rate: 22_050,
            speed: 1.0,
            segment_limit: DEFAULT_SEGMENT_LIMIT,
            trim_silence: true,
            unit_timeout_secs: 30,
            encoder_timeout_secs: 120,
            send_timeout_secs: 30,
            encoder: "ffmpeg".to_string(),
            encoder_args: None,
            mp3_bitrate: "128k".to_string(),
            max_text_length: 5000,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            });

        let encoder_args = env_string("TTS_ENCODER_ARGS")
            .map(|args| args.split_whitespace().map(str::to_string).collect());

        Self {
            port: env_or("PORT", defaults.port),
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            model_config: env_string("TTS_MODEL_CONFIG").map(PathBuf::from),
            sample_rate: env_or("TTS_SAMPLE_RATE", defaults.sample_rate),
            speed: env_or("TTS_SPEED", defaults.speed),
            segment_limit: env_or("TTS_SEGMENT_LIMIT", defaults.segment_limit),
            trim_silence: env_or("TTS_TRIM_SILENCE", defaults.trim_silence),
            unit_timeout_secs: env_or("TTS_UNIT_TIMEOUT_SECS", defaults.unit_timeout_secs),
            encoder_timeout_secs: env_or("TTS_ENCODER_TIMEOUT_SECS", defaults.encoder_timeout_secs),
            send_timeout_secs: env_or("TTS_SEND_TIMEOUT_SECS", defaults.send_timeout_secs),
            encoder: env_string("TTS_ENCODER").unwrap_or(defaults.encoder),
            encoder_args,
            mp3_bitrate: env_string("TTS_MP3_BITRATE").unwrap_or(defaults.mp3_bitrate),
            max_text_length: env_or("MAX_TEXT_LENGTH", defaults.max_text_length),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            segment_limit: self.segment_limit.max(1),
            default_speed: tts_core::synth::clamp_speed(self.speed),
            trim_silence: self.trim_silence,
            unit_timeout: Duration::from_secs(self.unit_timeout_secs),
            encoder_timeout: Duration::from_secs(self.encoder_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }

    /// The MP3 encoder command, with the argument template overridden when
    /// `TTS_ENCODER_ARGS` is set.
    pub fn encoder_spec(&self) -> EncoderSpec {
        let mut spec = EncoderSpec::mp3(&self.encoder, &self.mp3_bitrate);
        if let Some(args) = &self.encoder_args {
            spec.args = args.clone();
        }
        spec
    }
}
