//! WAV frame encoding and the `wav-l32be` wire framing.
//!
//! Every audio frame is a complete 16-bit mono PCM WAV file: a fixed
//! 44-byte RIFF header followed by the little-endian samples, so a client can
//! decode any frame on its own. On the wire each frame is preceded by its
//! byte length as a big-endian u32.

use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;
use crate::synth::PcmBuffer;

/// Name of the framing scheme, advertised to clients in a response header.
pub const FRAMING: &str = "wav-l32be";
/// Size of the RIFF/WAVE header preceding every payload.
pub const HEADER_LEN: usize = 44;
/// Size of the wire length prefix.
pub const PREFIX_LEN: usize = 4;
/// Largest frame a reader accepts.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Container header plus the PCM payload it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub header: [u8; HEADER_LEN],
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// A frame with its length prefix, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub length_prefix: u32,
    pub frame_bytes: Vec<u8>,
}

impl WireFrame {
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREFIX_LEN + self.frame_bytes.len());
        out.extend_from_slice(&self.length_prefix.to_be_bytes());
        out.extend_from_slice(&self.frame_bytes);
        out
    }
}

/// Build the 44-byte header for `data_size` bytes of 16-bit mono PCM.
pub fn wav_header(sample_rate: u32, data_size: u32) -> [u8; HEADER_LEN] {
    let num_channels = PcmBuffer::CHANNELS;
    let bits_per_sample = PcmBuffer::BITS_PER_SAMPLE;
    let byte_rate: u32 = sample_rate * num_channels as u32 * (bits_per_sample as u32 / 8);
    let block_align: u16 = num_channels * (bits_per_sample / 8);
    let riff_size: u32 = 36u32.saturating_add(data_size);

    let mut out = [0u8; HEADER_LEN];
    let fields: [&[u8]; 13] = [
        b"RIFF",
        &riff_size.to_le_bytes(),
        b"WAVE",
        b"fmt ",
        &16u32.to_le_bytes(), // fmt chunk size
        &1u16.to_le_bytes(),  // PCM
        &num_channels.to_le_bytes(),
        &sample_rate.to_le_bytes(),
        &byte_rate.to_le_bytes(),
        &block_align.to_le_bytes(),
        &bits_per_sample.to_le_bytes(),
        b"data",
        &data_size.to_le_bytes(),
    ];
    let mut pos = 0;
    for field in fields {
        out[pos..pos + field.len()].copy_from_slice(field);
        pos += field.len();
    }
    debug_assert_eq!(pos, HEADER_LEN);
    out
}

/// Wrap a PCM buffer in a self-describing WAV container.
pub fn make_frame(pcm: PcmBuffer) -> Result<AudioFrame, FrameError> {
    let payload = pcm.to_le_bytes();
    let data_size = u32::try_from(payload.len())
        .ok()
        .filter(|n| n.checked_add(HEADER_LEN as u32).is_some())
        .ok_or(FrameError::TooLarge(u32::MAX))?;
    Ok(AudioFrame {
        header: wav_header(pcm.sample_rate, data_size),
        payload,
    })
}

/// Prefix a frame with its big-endian byte length.
pub fn to_wire(frame: AudioFrame) -> Result<WireFrame, FrameError> {
    let frame_bytes = frame.into_bytes();
    let length_prefix =
        u32::try_from(frame_bytes.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    Ok(WireFrame {
        length_prefix,
        frame_bytes,
    })
}

/// A whole WAV file for `pcm`, as served by buffered delivery.
pub fn encode_wav(pcm: PcmBuffer) -> Result<Vec<u8>, FrameError> {
    Ok(make_frame(pcm)?.into_bytes())
}

/// Parse one frame (header + payload) back into PCM.
pub fn decode_frame(bytes: &[u8]) -> Result<PcmBuffer, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            got: bytes.len(),
        });
    }
    let declared = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]) as usize;
    let got = bytes.len() - HEADER_LEN;
    if got < declared {
        return Err(FrameError::Truncated {
            expected: declared,
            got,
        });
    }

    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels != PcmBuffer::CHANNELS
        || spec.bits_per_sample != PcmBuffer::BITS_PER_SAMPLE
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(FrameError::Malformed(format!(
            "unsupported format: {} channel(s), {} bit {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    Ok(PcmBuffer {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on EOF at a frame boundary and
/// [`FrameError::Truncated`] when the stream ends inside a prefix or
/// before the promised number of bytes arrived.
pub async fn read_wire_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let got = read_full(reader, &mut prefix).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < PREFIX_LEN {
        return Err(FrameError::Truncated {
            expected: PREFIX_LEN,
            got,
        });
    }

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut frame = vec![0u8; len as usize];
    let got = read_full(reader, &mut frame).await?;
    if got < frame.len() {
        return Err(FrameError::Truncated {
            expected: frame.len(),
            got,
        });
    }
    Ok(Some(frame))
}

async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
