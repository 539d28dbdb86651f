//! Concrete [`SpeechModel`] bindings.

use std::{
    f32::consts::PI,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};
use tracing::info;

use crate::synth::{ModelInfo, SpeechModel, Waveform};

/// A Piper ONNX voice loaded from its `.onnx.json` config.
pub struct PiperVoice {
    synth: Mutex<PiperSpeechSynthesizer>,
    sample_rate: u32,
    config_path: PathBuf,
}

// PiperSpeechSynthesizer doesn't implement Debug
impl std::fmt::Debug for PiperVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiperVoice")
            .field("synth", &"<PiperSpeechSynthesizer>")
            .field("sample_rate", &self.sample_rate)
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl PiperVoice {
    pub fn load<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<Self> {
        let cfg_path = cfg_path.as_ref();
        let sample_rate = read_sample_rate(cfg_path)?;
        let model = piper_rs::from_config_path(cfg_path)
            .map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;
        let synth = PiperSpeechSynthesizer::new(model)
            .map_err(|e| anyhow::anyhow!("piper init error: {e}"))?;
        info!(config = %cfg_path.display(), sample_rate, "Loaded Piper voice");

        Ok(Self {
            synth: Mutex::new(synth),
            sample_rate,
            config_path: cfg_path.to_path_buf(),
        })
    }
}

/// Read `audio.sample_rate` from a Piper voice config.
fn read_sample_rate(cfg_path: &Path) -> anyhow::Result<u32> {
    let text = fs::read_to_string(cfg_path)
        .with_context(|| format!("Failed to read config file: {}", cfg_path.display()))?;
    let json: serde_json::Value =
        serde_json::from_str(&text).with_context(|| "Config file is not valid JSON")?;

    let sample_rate = json
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;

    u32::try_from(sample_rate).context("sample rate out of range")
}

impl SpeechModel for PiperVoice {
    fn synthesize(&self, text: &str) -> anyhow::Result<Waveform> {
        let synth = self.synth.lock().map_err(|_| {
            anyhow::anyhow!("Synthesizer lock poisoned - a previous synthesis panicked")
        })?;

        let iter: PiperSpeechStreamParallel = synth
            .synthesize_parallel(text.to_string(), None)
            .map_err(|e| anyhow::anyhow!("piper synth error: {e}"))?;

        let mut samples: Vec<f32> = Vec::new();
        for part in iter {
            samples.extend(
                part.map_err(|e| anyhow::anyhow!("chunk error: {e}"))?
                    .into_vec(),
            );
        }
        Ok(Waveform::mono(samples, self.sample_rate))
    }

    fn info(&self) -> ModelInfo {
        let name = self
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().trim_end_matches(".onnx.json").to_string())
            .unwrap_or_else(|| "piper".to_string());
        ModelInfo {
            name,
            device: "cpu".to_string(),
            sample_rate: self.sample_rate,
        }
    }
}

/// Placeholder voice: a fixed-length sine tone per unit. Keeps the service
/// runnable without a model on disk.
#[derive(Debug, Clone)]
pub struct ToneModel {
    pub sample_rate: u32,
    pub frequency: f32,
    pub amplitude: f32,
    pub seconds: f32,
}

impl ToneModel {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frequency: 440.0,
            amplitude: 0.2,
            seconds: 0.5,
        }
    }
}

impl SpeechModel for ToneModel {
    fn synthesize(&self, _text: &str) -> anyhow::Result<Waveform> {
        let len = (self.sample_rate as f32 * self.seconds) as usize;
        let step = 2.0 * PI * self.frequency / self.sample_rate as f32;
        let samples = (0..len)
            .map(|i| self.amplitude * (step * i as f32).sin())
            .collect();
        Ok(Waveform::mono(samples, self.sample_rate))
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: format!("tone-{}hz", self.frequency as u32),
            device: "cpu".to_string(),
            sample_rate: self.sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_model_length_and_amplitude() {
        let model = ToneModel::new(22_050);
        let wave = model.synthesize("anything").unwrap();
        assert_eq!(wave.sample_rate, 22_050);
        assert_eq!(wave.channels, 1);
        assert_eq!(wave.samples.len(), 11_025);
        let peak = wave.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.2 + f32::EPSILON);
        assert!(peak > 0.19);
        assert_eq!(model.info().name, "tone-440hz");
    }

    #[test]
    fn test_read_sample_rate() {
        let dir = std::env::temp_dir().join(format!("tts-core-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let good = dir.join("voice.onnx.json");
        fs::write(&good, r#"{"audio": {"sample_rate": 16000}}"#).unwrap();
        assert_eq!(read_sample_rate(&good).unwrap(), 16_000);

        let bad = dir.join("broken.onnx.json");
        fs::write(&bad, r#"{"audio": {}}"#).unwrap();
        assert!(read_sample_rate(&bad).is_err());

        assert!(PiperVoice::load(dir.join("missing.onnx.json")).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
