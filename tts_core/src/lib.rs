//! Core of the speech service: text segmentation, model adapter, WAV
//! framing, the external encoder relay and the per-request stream
//! controller that ties them together.

pub mod error;
pub mod model;
pub mod pipeline;
pub mod relay;
pub mod segment;
pub mod synth;
pub mod transport;
pub mod wav;

pub use error::{FrameError, PipelineError};
pub use model::{PiperVoice, ToneModel};
pub use pipeline::{
    DeliveryMode, PipelineConfig, SpeechPipeline, SpeechRequest, StreamState, StreamSummary,
};
pub use relay::{EncoderProcess, EncoderSpec, PcmStream, RelayStats};
pub use segment::{segment, TextUnit, DEFAULT_SEGMENT_LIMIT};
pub use synth::{ModelInfo, PcmBuffer, SpeechModel, SynthesisOptions, Waveform};
pub use transport::{BufferTransport, ChannelTransport, ChunkResult, Transport, WriterTransport};
pub use wav::{decode_frame, encode_wav, read_wire_frame, FRAMING};
