//! Per-request stream controller.
//!
//! A request moves through
//! `Received → Segmented → Synthesizing(i) → Emitting(i) → … → Completed`,
//! or to `Failed` from any state. Units are emitted strictly in ordinal
//! order. In incremental mode unit `i + 1` is already being synthesized while
//! frame `i` is written, so time to first byte is the synthesis time of the
//! first unit alone.
//!
//! Once any byte has reached the transport a failure can no longer become a
//! clean error response; the transport is aborted instead and the client
//! sees a truncated stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::relay::{EncoderProcess, EncoderSpec, PcmStream};
use crate::segment::{segment, TextUnit, DEFAULT_SEGMENT_LIMIT};
use crate::synth::{
    clamp_speed, synthesize_unit, ModelInfo, PcmBuffer, SpeechModel, SynthesisOptions,
};
use crate::transport::{BufferTransport, Transport};
use crate::wav::{encode_wav, make_frame, to_wire};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub segment_limit: usize,
    pub default_speed: f32,
    pub trim_silence: bool,
    pub unit_timeout: Duration,
    /// Budget for the encoder itself, on top of the synthesis it waits for.
    pub encoder_timeout: Duration,
    /// Longest a single transport write may block on a stalled client.
    pub send_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_limit: DEFAULT_SEGMENT_LIMIT,
            default_speed: 1.0,
            trim_silence: true,
            unit_timeout: Duration::from_secs(30),
            encoder_timeout: Duration::from_secs(120),
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Overall limit for an encoder run over `units` units. The encoder
    /// idles while each unit is synthesized, so every unit adds its own
    /// synthesis allowance.
    pub fn encoder_budget(&self, units: usize) -> Duration {
        let units = u32::try_from(units).unwrap_or(u32::MAX);
        self.encoder_timeout
            .saturating_add(self.unit_timeout.saturating_mul(units))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Synthesize everything, then send one container.
    #[default]
    Buffered,
    /// Send each unit as soon as it is ready.
    Incremental,
}

impl DeliveryMode {
    pub fn from_stream_flag(stream: bool) -> Self {
        if stream {
            Self::Incremental
        } else {
            Self::Buffered
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub sample_rate: Option<u32>,
    pub speed: Option<f32>,
    pub mode: DeliveryMode,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>, mode: DeliveryMode) -> Self {
        Self {
            text: text.into(),
            sample_rate: None,
            speed: None,
            mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Received,
    Segmented { units: usize },
    Synthesizing(usize),
    Emitting(usize),
    Completed,
    Failed,
}

/// What a finished request delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSummary {
    pub units: usize,
    pub chunks: usize,
    pub bytes: u64,
    /// Time spent in the model, summed over units.
    pub synthesis: Duration,
}

/// State of one request. Clones share the same state, so the PCM producer
/// of the encoded path reports into the request that owns it.
#[derive(Debug, Clone)]
struct Tracker {
    states: Arc<Mutex<Vec<StreamState>>>,
}

impl Tracker {
    fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(vec![StreamState::Received])),
        }
    }

    fn advance(&self, next: StreamState) {
        if let Ok(mut states) = self.states.lock() {
            debug!(from = ?states.last(), to = ?next, "stream state");
            states.push(next);
        }
    }

    #[cfg(test)]
    fn history(&self) -> Vec<StreamState> {
        self.states.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Sum of per-unit synthesis time, shared with background producers.
#[derive(Debug, Clone, Default)]
struct SynthesisClock(Arc<AtomicU64>);

impl SynthesisClock {
    fn add(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.0.fetch_add(micros, Ordering::Relaxed);
    }

    fn total(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }
}

/// Counts what actually reached the client and bounds each write.
struct Metered<'a, T: ?Sized> {
    inner: &'a mut T,
    send_timeout: Duration,
    chunks: usize,
    bytes: u64,
}

impl<'a, T: Transport + ?Sized> Metered<'a, T> {
    fn new(inner: &'a mut T, send_timeout: Duration) -> Self {
        Self {
            inner,
            send_timeout,
            chunks: 0,
            bytes: 0,
        }
    }

    fn started(&self) -> bool {
        self.bytes > 0
    }

    fn summary(&self, units: usize, clock: &SynthesisClock) -> StreamSummary {
        StreamSummary {
            units,
            chunks: self.chunks,
            bytes: self.bytes,
            synthesis: clock.total(),
        }
    }

    /// Record the failure and, if output already began, cut the stream.
    async fn fail(&mut self, tracker: &Tracker, err: PipelineError) -> PipelineError {
        tracker.advance(StreamState::Failed);
        log_failure(&err, self.bytes);
        if self.started() && !err.is_disconnect() {
            // A stalled client may never make room for the abort either.
            let _ = tokio::time::timeout(self.send_timeout, self.inner.abort(&err)).await;
        }
        err
    }
}

#[async_trait]
impl<'a, T: Transport + ?Sized> Transport for Metered<'a, T> {
    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), PipelineError> {
        let len = chunk.len() as u64;
        match tokio::time::timeout(self.send_timeout, self.inner.send(chunk)).await {
            Ok(sent) => sent?,
            Err(_) => {
                return Err(PipelineError::Timeout {
                    stage: "transport",
                    after: self.send_timeout,
                })
            }
        }
        self.chunks += 1;
        self.bytes += len;
        Ok(())
    }

    async fn abort(&mut self, err: &PipelineError) {
        self.inner.abort(err).await;
    }
}

fn log_failure(err: &PipelineError, bytes_sent: u64) {
    match err {
        PipelineError::ClientDisconnected => {
            info!(bytes_sent, "Client disconnected, stopping synthesis")
        }
        PipelineError::Timeout { stage, after } => {
            warn!(stage, ?after, bytes_sent, "Pipeline stage timed out")
        }
        PipelineError::EmptyInput => debug!("Rejected request with no synthesizable text"),
        other => error!(category = other.category(), bytes_sent, "Speech request failed: {other}"),
    }
}

/// Synthesis of one unit running off the async runtime. Aborted when
/// dropped, so an abandoned request stops waiting on it.
struct UnitTask {
    ordinal: usize,
    handle: JoinHandle<Result<(PcmBuffer, Duration), PipelineError>>,
}

impl UnitTask {
    async fn join(mut self, clock: &SynthesisClock) -> Result<PcmBuffer, PipelineError> {
        let ordinal = self.ordinal;
        let (pcm, elapsed) = (&mut self.handle).await.unwrap_or_else(|e| {
            Err(PipelineError::synthesis(ordinal, format!("synthesis task failed: {e}")))
        })?;
        clock.add(elapsed);
        Ok(pcm)
    }
}

impl Drop for UnitTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run the blocking model call on the blocking pool, bounded by `limit`.
/// Returns the PCM with the time the model took.
async fn synthesize_blocking(
    model: Arc<dyn SpeechModel>,
    unit: TextUnit,
    opts: SynthesisOptions,
    limit: Duration,
) -> Result<(PcmBuffer, Duration), PipelineError> {
    let ordinal = unit.ordinal;
    let task = tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        synthesize_unit(model.as_ref(), &unit, &opts).map(|pcm| (pcm, started.elapsed()))
    });

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => {
            if let Ok((pcm, elapsed)) = &result {
                debug!(
                    ordinal,
                    samples = pcm.samples.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Unit synthesized"
                );
            }
            result
        }
        Ok(Err(e)) => Err(PipelineError::synthesis(
            ordinal,
            format!("synthesis task failed: {e}"),
        )),
        Err(_) => Err(PipelineError::Timeout {
            stage: "synthesis",
            after: limit,
        }),
    }
}

/// The request-scoped orchestrator around one shared, read-only model.
#[derive(Clone)]
pub struct SpeechPipeline {
    model: Arc<dyn SpeechModel>,
    config: PipelineConfig,
}

impl std::fmt::Debug for SpeechPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechPipeline")
            .field("model", &self.model.info().name)
            .field("config", &self.config)
            .finish()
    }
}

impl SpeechPipeline {
    pub fn new(model: Arc<dyn SpeechModel>, config: PipelineConfig) -> Self {
        Self { model, config }
    }

    pub fn model_info(&self) -> ModelInfo {
        self.model.info()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn options_for(&self, req: &SpeechRequest) -> SynthesisOptions {
        SynthesisOptions {
            sample_rate: req.sample_rate,
            speed: clamp_speed(req.speed.unwrap_or(self.config.default_speed)),
            trim_silence: self.config.trim_silence,
        }
    }

    /// Rate of the audio this request will produce.
    pub fn output_rate(&self, req: &SpeechRequest) -> u32 {
        req.sample_rate.unwrap_or_else(|| self.model.info().sample_rate)
    }

    /// Segment the request text; fails with `EmptyInput` when nothing is left.
    pub fn prepare(&self, text: &str) -> Result<Vec<TextUnit>, PipelineError> {
        let units = segment(text, self.config.segment_limit);
        if units.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        Ok(units)
    }

    fn spawn_unit(&self, unit: TextUnit, opts: SynthesisOptions) -> UnitTask {
        let ordinal = unit.ordinal;
        let model = Arc::clone(&self.model);
        let limit = self.config.unit_timeout;
        UnitTask {
            ordinal,
            handle: tokio::spawn(synthesize_blocking(model, unit, opts, limit)),
        }
    }

    /// Synthesize every unit in order and concatenate the result.
    pub async fn render(&self, req: &SpeechRequest) -> Result<PcmBuffer, PipelineError> {
        let tracker = Tracker::new();
        let clock = SynthesisClock::default();
        match self.render_tracked(req, &tracker, &clock).await {
            Ok((audio, _)) => {
                tracker.advance(StreamState::Completed);
                Ok(audio)
            }
            Err(err) => {
                tracker.advance(StreamState::Failed);
                log_failure(&err, 0);
                Err(err)
            }
        }
    }

    async fn render_tracked(
        &self,
        req: &SpeechRequest,
        tracker: &Tracker,
        clock: &SynthesisClock,
    ) -> Result<(PcmBuffer, usize), PipelineError> {
        let units = self.prepare(&req.text)?;
        let total = units.len();
        tracker.advance(StreamState::Segmented { units: total });
        let opts = self.options_for(req);

        let mut audio = PcmBuffer {
            samples: Vec::new(),
            sample_rate: self.output_rate(req),
        };
        for unit in units {
            tracker.advance(StreamState::Synthesizing(unit.ordinal));
            let pcm = self.spawn_unit(unit, opts).join(clock).await?;
            audio.append(pcm);
        }
        Ok((audio, total))
    }

    /// Buffered delivery as a single WAV file.
    pub async fn render_wav(&self, req: &SpeechRequest) -> Result<Vec<u8>, PipelineError> {
        let audio = self.render(req).await?;
        encode_wav(audio).map_err(|e| PipelineError::encoding(e.to_string()))
    }

    /// Deliver WAV audio over `transport`: one container in buffered mode,
    /// a sequence of `wav-l32be` wire frames in incremental mode.
    pub async fn stream_wav<T: Transport + ?Sized>(
        &self,
        req: &SpeechRequest,
        transport: &mut T,
    ) -> Result<StreamSummary, PipelineError> {
        let tracker = Tracker::new();
        let clock = SynthesisClock::default();
        let mut out = Metered::new(transport, self.config.send_timeout);

        let result = match req.mode {
            DeliveryMode::Buffered => {
                self.send_buffered_wav(req, &mut out, &tracker, &clock).await
            }
            DeliveryMode::Incremental => self.send_frames(req, &mut out, &tracker, &clock).await,
        };

        match result {
            Ok(units) => {
                tracker.advance(StreamState::Completed);
                Ok(out.summary(units, &clock))
            }
            Err(err) => Err(out.fail(&tracker, err).await),
        }
    }

    async fn send_buffered_wav<T: Transport + ?Sized>(
        &self,
        req: &SpeechRequest,
        out: &mut Metered<'_, T>,
        tracker: &Tracker,
        clock: &SynthesisClock,
    ) -> Result<usize, PipelineError> {
        let (audio, units) = self.render_tracked(req, tracker, clock).await?;
        tracker.advance(StreamState::Emitting(0));
        let bytes = encode_wav(audio).map_err(|e| PipelineError::encoding(e.to_string()))?;
        out.send(bytes).await?;
        Ok(units)
    }

    async fn send_frames<T: Transport + ?Sized>(
        &self,
        req: &SpeechRequest,
        out: &mut Metered<'_, T>,
        tracker: &Tracker,
        clock: &SynthesisClock,
    ) -> Result<usize, PipelineError> {
        let units = self.prepare(&req.text)?;
        let total = units.len();
        tracker.advance(StreamState::Segmented { units: total });
        let opts = self.options_for(req);

        let mut queue = units.into_iter();
        let mut pending = queue.next().map(|u| self.spawn_unit(u, opts));
        while let Some(task) = pending.take() {
            let ordinal = task.ordinal;
            tracker.advance(StreamState::Synthesizing(ordinal));
            let pcm = task.join(clock).await?;

            // Start on the next unit while this frame is written.
            pending = queue.next().map(|u| self.spawn_unit(u, opts));

            tracker.advance(StreamState::Emitting(ordinal));
            let wire = make_frame(pcm)
                .and_then(to_wire)
                .map_err(|e| PipelineError::encoding(e.to_string()))?;
            let len = wire.length_prefix;
            out.send(wire.into_bytes()).await?;
            debug!(ordinal, total, frame_bytes = len, "Frame emitted");
        }
        Ok(total)
    }

    /// PCM bytes for `units`, synthesized one at a time in order.
    pub fn pcm_stream(&self, units: Vec<TextUnit>, opts: SynthesisOptions) -> PcmStream {
        self.tracked_pcm_stream(units, opts, Tracker::new(), SynthesisClock::default())
    }

    fn tracked_pcm_stream(
        &self,
        units: Vec<TextUnit>,
        opts: SynthesisOptions,
        tracker: Tracker,
        clock: SynthesisClock,
    ) -> PcmStream {
        let model = Arc::clone(&self.model);
        let limit = self.config.unit_timeout;
        Box::pin(async_stream::stream! {
            for unit in units {
                let ordinal = unit.ordinal;
                tracker.advance(StreamState::Synthesizing(ordinal));
                match synthesize_blocking(Arc::clone(&model), unit, opts, limit).await {
                    Ok((pcm, elapsed)) => {
                        clock.add(elapsed);
                        tracker.advance(StreamState::Emitting(ordinal));
                        yield Ok(pcm.to_le_bytes());
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    /// Deliver audio compressed by an external encoder. Incremental mode
    /// relays encoder output as it is produced; buffered mode collects it
    /// and sends it once the encoder has exited cleanly.
    pub async fn stream_encoded<T: Transport + ?Sized>(
        &self,
        req: &SpeechRequest,
        encoder: &EncoderSpec,
        transport: &mut T,
    ) -> Result<StreamSummary, PipelineError> {
        let tracker = Tracker::new();
        let clock = SynthesisClock::default();
        let mut out = Metered::new(transport, self.config.send_timeout);

        match self
            .send_encoded(req, encoder, &mut out, &tracker, &clock)
            .await
        {
            Ok(units) => {
                tracker.advance(StreamState::Completed);
                Ok(out.summary(units, &clock))
            }
            Err(err) => Err(out.fail(&tracker, err).await),
        }
    }

    async fn send_encoded<T: Transport + ?Sized>(
        &self,
        req: &SpeechRequest,
        encoder: &EncoderSpec,
        out: &mut Metered<'_, T>,
        tracker: &Tracker,
        clock: &SynthesisClock,
    ) -> Result<usize, PipelineError> {
        let units = self.prepare(&req.text)?;
        let total = units.len();
        tracker.advance(StreamState::Segmented { units: total });

        let opts = self.options_for(req);
        let process = EncoderProcess::spawn(encoder, self.output_rate(req))?;
        let pcm = self.tracked_pcm_stream(units, opts, tracker.clone(), clock.clone());

        let limit = self.config.encoder_budget(total);
        match req.mode {
            DeliveryMode::Incremental => {
                process.relay(pcm, out, limit).await?;
            }
            DeliveryMode::Buffered => {
                let mut buffer = BufferTransport::default();
                process.relay(pcm, &mut buffer, limit).await?;
                out.send(buffer.bytes).await?;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::synth::{quantize, Waveform};
    use crate::transport::{BufferTransport, ChannelTransport, WriterTransport};
    use crate::wav::{decode_frame, read_wire_frame};

    /// Emits a constant level that grows with each call, so output order is
    /// visible in the samples.
    #[derive(Default)]
    struct CountingModel {
        calls: AtomicUsize,
        fail_on: Option<usize>,
        delay: Duration,
    }

    fn level(call: usize) -> f32 {
        call as f32 / 8.0
    }

    impl SpeechModel for CountingModel {
        fn synthesize(&self, _text: &str) -> anyhow::Result<Waveform> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail_on == Some(call) {
                anyhow::bail!("voice crashed on call {call}");
            }
            Ok(Waveform::mono(vec![level(call); 100], 1_000))
        }

        fn info(&self) -> ModelInfo {
            ModelInfo {
                name: "counting".to_string(),
                device: "cpu".to_string(),
                sample_rate: 1_000,
            }
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            segment_limit: 20,
            unit_timeout: Duration::from_secs(5),
            encoder_timeout: Duration::from_secs(5),
            ..PipelineConfig::default()
        }
    }

    fn pipeline_with(model: CountingModel) -> SpeechPipeline {
        SpeechPipeline::new(Arc::new(model), test_config())
    }

    #[tokio::test]
    async fn test_empty_input_writes_nothing() {
        let pipeline = pipeline_with(CountingModel::default());
        let mut transport = BufferTransport::default();
        let req = SpeechRequest::new("   \n  ", DeliveryMode::Incremental);

        let err = pipeline.stream_wav(&req, &mut transport).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput));
        assert!(transport.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_frames_arrive_in_order() {
        let pipeline = pipeline_with(CountingModel::default());
        let text = (1..=6)
            .map(|n| format!("Sentence number {n} is here."))
            .collect::<Vec<_>>()
            .join(" ");
        let req = SpeechRequest::new(text, DeliveryMode::Incremental);

        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut transport = WriterTransport::new(client);
        let summary = pipeline.stream_wav(&req, &mut transport).await.unwrap();
        drop(transport);

        assert_eq!(summary.units, 6);
        assert_eq!(summary.chunks, 6);

        let mut seen = Vec::new();
        while let Some(frame) = read_wire_frame(&mut server).await.unwrap() {
            let pcm = decode_frame(&frame).unwrap();
            assert_eq!(pcm.samples.len(), 100);
            seen.push(pcm.samples[0]);
        }
        let expected: Vec<i16> = (1..=6).map(|n| quantize(&[level(n)])[0]).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_buffered_wav_is_single_container() {
        let pipeline = pipeline_with(CountingModel::default());
        let req = SpeechRequest::new("One. Two. Three.", DeliveryMode::Buffered);
        let mut transport = BufferTransport::default();

        let summary = pipeline.stream_wav(&req, &mut transport).await.unwrap();
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.units, 1);

        let pcm = decode_frame(&transport.bytes).unwrap();
        assert_eq!(pcm.sample_rate, 1_000);
        assert_eq!(pcm.samples.len(), 100);
    }

    #[tokio::test]
    async fn test_buffered_concatenates_units() {
        let pipeline = pipeline_with(CountingModel::default());
        let req = SpeechRequest::new(
            "The first sentence is long. The second one is too.",
            DeliveryMode::Buffered,
        );
        let wav = pipeline.render_wav(&req).await.unwrap();
        let pcm = decode_frame(&wav).unwrap();
        assert_eq!(pcm.samples.len(), 200);
        assert_eq!(pcm.samples[0], quantize(&[level(1)])[0]);
        assert_eq!(pcm.samples[199], quantize(&[level(2)])[0]);
    }

    #[tokio::test]
    async fn test_synthesis_failure_aborts_after_first_frame() {
        let model = CountingModel {
            fail_on: Some(2),
            ..CountingModel::default()
        };
        let pipeline = pipeline_with(model);
        // Packs into "First. Second." and "Third."
        let req = SpeechRequest::new("First. Second. Third.", DeliveryMode::Incremental);
        let (mut transport, mut rx) = ChannelTransport::new(8);

        let err = pipeline.stream_wav(&req, &mut transport).await.unwrap_err();
        assert!(matches!(err, PipelineError::Synthesis { ordinal: 1, .. }));
        drop(transport);

        assert!(matches!(rx.recv().await, Some(Ok(_))));
        assert!(matches!(
            rx.recv().await,
            Some(Err(PipelineError::Synthesis { .. }))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_before_output_is_not_aborted() {
        let model = CountingModel {
            fail_on: Some(1),
            ..CountingModel::default()
        };
        let pipeline = pipeline_with(model);
        let req = SpeechRequest::new("Only one.", DeliveryMode::Incremental);
        let (mut transport, mut rx) = ChannelTransport::new(8);

        let err = pipeline.stream_wav(&req, &mut transport).await.unwrap_err();
        assert_eq!(err.category(), "synthesis");
        drop(transport);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_stops_the_stream() {
        let pipeline = pipeline_with(CountingModel::default());
        let req = SpeechRequest::new("A. B. C. D.", DeliveryMode::Incremental);
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut transport = WriterTransport::new(client);

        let err = pipeline.stream_wav(&req, &mut transport).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_unit_timeout() {
        let model = CountingModel {
            delay: Duration::from_millis(300),
            ..CountingModel::default()
        };
        let config = PipelineConfig {
            unit_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let pipeline = SpeechPipeline::new(Arc::new(model), config);

        let err = pipeline
            .render(&SpeechRequest::new("Slow.", DeliveryMode::Buffered))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                stage: "synthesis",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_speed_and_rate_follow_request() {
        let pipeline = pipeline_with(CountingModel::default());
        let req = SpeechRequest {
            text: "Hello.".to_string(),
            sample_rate: Some(2_000),
            speed: Some(2.0),
            mode: DeliveryMode::Buffered,
        };
        let audio = pipeline.render(&req).await.unwrap();
        assert_eq!(audio.sample_rate, 2_000);
        // Doubling the rate and the speed cancel out in length.
        assert_eq!(audio.samples.len(), 100);
        assert_eq!(pipeline.output_rate(&req), 2_000);

        let slow = SpeechRequest {
            speed: Some(0.1),
            ..req
        };
        assert_eq!(pipeline.options_for(&slow).speed, 0.5);
    }

    #[test]
    fn test_delivery_mode_from_flag() {
        assert_eq!(
            DeliveryMode::from_stream_flag(true),
            DeliveryMode::Incremental
        );
        assert_eq!(DeliveryMode::from_stream_flag(false), DeliveryMode::Buffered);
        assert_eq!(DeliveryMode::default(), DeliveryMode::Buffered);
    }

    #[test]
    fn test_encoder_budget_grows_with_units() {
        let config = PipelineConfig {
            unit_timeout: Duration::from_secs(2),
            encoder_timeout: Duration::from_secs(10),
            ..PipelineConfig::default()
        };
        assert_eq!(config.encoder_budget(0), Duration::from_secs(10));
        assert_eq!(config.encoder_budget(3), Duration::from_secs(16));
        let huge = PipelineConfig {
            unit_timeout: Duration::MAX,
            ..config
        };
        assert_eq!(huge.encoder_budget(2), Duration::MAX);
    }

    #[tokio::test]
    async fn test_summary_reports_synthesis_time() {
        let model = CountingModel {
            delay: Duration::from_millis(20),
            ..CountingModel::default()
        };
        let pipeline = pipeline_with(model);
        let req = SpeechRequest::new(
            "The first sentence is long. The second one is too.",
            DeliveryMode::Incremental,
        );
        let mut transport = BufferTransport::default();

        let summary = pipeline.stream_wav(&req, &mut transport).await.unwrap();
        assert_eq!(summary.units, 2);
        assert!(summary.synthesis >= Duration::from_millis(40), "{summary:?}");
    }

    #[tokio::test]
    async fn test_stalled_client_times_out() {
        let pipeline = SpeechPipeline::new(
            Arc::new(CountingModel::default()),
            PipelineConfig {
                send_timeout: Duration::from_millis(100),
                ..test_config()
            },
        );
        let req = SpeechRequest::new(
            "First sentence here. Second sentence here. Third sentence here.",
            DeliveryMode::Incremental,
        );
        // The receiver is held but never read.
        let (mut transport, _rx) = ChannelTransport::new(1);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.stream_wav(&req, &mut transport),
        )
        .await
        .expect("stalled client must not hold the request")
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                stage: "transport",
                ..
            }
        ));
    }

    #[cfg(unix)]
    fn cat() -> EncoderSpec {
        EncoderSpec {
            program: "cat".to_string(),
            args: Vec::new(),
            bitrate: String::new(),
            content_type: "application/octet-stream".to_string(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoded_path_reports_each_unit() {
        let pipeline = pipeline_with(CountingModel::default());
        let req = SpeechRequest::new("One. Two. Three.", DeliveryMode::Incremental);
        let tracker = Tracker::new();
        let clock = SynthesisClock::default();
        let mut transport = BufferTransport::default();
        let mut out = Metered::new(&mut transport, Duration::from_secs(5));

        let units = pipeline
            .send_encoded(&req, &cat(), &mut out, &tracker, &clock)
            .await
            .unwrap();
        assert_eq!(units, 1);
        assert_eq!(
            tracker.history(),
            vec![
                StreamState::Received,
                StreamState::Segmented { units: 1 },
                StreamState::Synthesizing(0),
                StreamState::Emitting(0),
            ]
        );
        assert_eq!(transport.bytes.len(), 200);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_limit_excludes_synthesis_time() {
        let model = CountingModel {
            delay: Duration::from_millis(80),
            ..CountingModel::default()
        };
        let config = PipelineConfig {
            unit_timeout: Duration::from_millis(300),
            encoder_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let pipeline = SpeechPipeline::new(Arc::new(model), config);
        // Three units whose synthesis together outlasts the bare encoder limit.
        let req = SpeechRequest::new(
            "First sentence here. Second sentence here. Third sentence here.",
            DeliveryMode::Buffered,
        );
        let mut transport = BufferTransport::default();

        let summary = pipeline
            .stream_encoded(&req, &cat(), &mut transport)
            .await
            .unwrap();
        assert_eq!(summary.units, 3);
        assert_eq!(transport.bytes.len(), 600);
        assert!(summary.synthesis >= Duration::from_millis(240));
    }
}
