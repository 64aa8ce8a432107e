use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

use crate::kernel::audio::segment::{AudioFormat, DecodedSegment, SegmentKey};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("WAV decode failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("Compressed audio decode failed: {0}")]
    Compressed(#[from] SymphoniaError),

    #[error("Resampling failed: {0}")]
    Resample(String),

    #[error("No audio track found")]
    NoTrack,

    #[error("Audio payload is empty")]
    Empty,
}

const RESAMPLE_CHUNK: usize = 1024;

/// Turns fetched bytes into mono f32 at the output rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioDecoder {
    target_rate: Option<u32>,
}

impl AudioDecoder {
    /// `target_rate` of None keeps each segment at its native rate.
    pub fn new(target_rate: Option<u32>) -> Self {
        Self { target_rate }
    }

    pub fn target_rate(&self) -> Option<u32> {
        self.target_rate
    }

    pub fn decode(
        &self,
        key: SegmentKey,
        bytes: &[u8],
        hint: Option<AudioFormat>,
    ) -> Result<DecodedSegment, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let format = sniff_format(bytes).or(hint);
        let (samples, channels, rate) = match format {
            Some(AudioFormat::Wav) => decode_wav(bytes)?,
            _ => decode_compressed(bytes, format)?,
        };
        let mono = downmix(samples, channels);

        let (samples, rate) = match self.target_rate {
            Some(target) if target != rate && rate > 0 => (resample(&mono, rate, target)?, target),
            _ => (mono, rate),
        };
        debug!(segment = %key.segment_id, rate, frames = samples.len(), "Decoded segment");
        Ok(DecodedSegment::new(key, samples, rate))
    }
}

/// Magic bytes win over the descriptor's hint.
pub fn sniff_format(bytes: &[u8]) -> Option<AudioFormat> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Some(AudioFormat::Wav);
    }
    if bytes.starts_with(b"ID3") {
        return Some(AudioFormat::Mpeg);
    }
    if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        return Some(AudioFormat::Mpeg);
    }
    None
}

fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, usize, u32), DecodeError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };
    Ok((samples, spec.channels.max(1) as usize, spec.sample_rate))
}

fn decode_compressed(bytes: &[u8], format: Option<AudioFormat>) -> Result<(Vec<f32>, usize, u32), DecodeError> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    if let Some(format) = format {
        hint.with_extension(format.extension());
    }
    let probed = symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?;
    let track_id = track.id;
    let mut rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                rate = spec.rate;
                channels = spec.channels.count().max(1);
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            // A corrupt frame costs a few milliseconds, not the segment.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if samples.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok((samples, channels, rate))
}

/// Average interleaved channels into one.
pub fn downmix(samples: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Mono FFT resampling.
pub fn resample(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>, DecodeError> {
    if from == to || input.is_empty() {
        return Ok(input.to_vec());
    }
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;

    let expected = (input.len() as f64 * to as f64 / from as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = input.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let frames = resampler
            .process(&[chunk], None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let frames = resampler
            .process_partial(Some(&[rest][..]), None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }
    // Flush the filter tail until the delayed output is covered.
    while out.len() < expected + delay {
        let frames = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let end = (delay + expected).min(out.len());
    Ok(out[delay.min(end)..end].to_vec())
}
