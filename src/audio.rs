//! In-memory mono PCM audio.
//!
//! Every stage of the pipeline that touches samples works on [`AudioBuffer`]:
//! the chunker scans it for silence, the synthesizer pads and fades it and the
//! timeline assembler writes it onto the narration track. Containers other than
//! WAV are converted by the media processor before they get here.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use tracing::debug;

use crate::error::{DubError, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Number of frames covering `duration` at `sample_rate`, rounded to nearest.
pub fn frames_for(duration: Duration, sample_rate: u32) -> usize {
    ((duration.as_nanos() * sample_rate as u128 + NANOS_PER_SEC / 2) / NANOS_PER_SEC) as usize
}

/// Time position of `frame` at `sample_rate`.
pub fn time_at(frame: usize, sample_rate: u32) -> Duration {
    let nanos = frame as u128 * NANOS_PER_SEC / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        Self::new(vec![0.0; frames_for(duration, sample_rate)], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        time_at(self.samples.len(), self.sample_rate)
    }

    /// Copy of the frames between `start` and `end`, clamped to the buffer.
    pub fn slice(&self, start: Duration, end: Duration) -> AudioBuffer {
        let from = frames_for(start, self.sample_rate).min(self.samples.len());
        let to = frames_for(end, self.sample_rate).clamp(from, self.samples.len());
        AudioBuffer::new(self.samples[from..to].to_vec(), self.sample_rate)
    }

    pub fn append(&mut self, other: &AudioBuffer) -> Result<()> {
        if other.sample_rate != self.sample_rate {
            return Err(DubError::Audio(format!(
                "Cannot append {} Hz audio to a {} Hz buffer",
                other.sample_rate, self.sample_rate
            )));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    pub fn append_silence_frames(&mut self, frames: usize) {
        self.samples.resize(self.samples.len() + frames, 0.0);
    }

    pub fn truncate_frames(&mut self, frames: usize) {
        self.samples.truncate(frames);
    }

    /// Linear fade to zero over the last `duration` of the buffer.
    pub fn fade_out(&mut self, duration: Duration) {
        let n = frames_for(duration, self.sample_rate).min(self.samples.len());
        if n == 0 {
            return;
        }
        let offset = self.samples.len() - n;
        for (i, sample) in self.samples[offset..].iter_mut().enumerate() {
            let gain = (n - 1 - i) as f32 / n as f32;
            *sample *= gain;
        }
    }

    /// Convert to `target_rate`, keeping the duration.
    pub fn resample_to(&self, target_rate: u32) -> Result<AudioBuffer> {
        if target_rate == self.sample_rate {
            return Ok(self.clone());
        }
        if self.samples.is_empty() {
            return Ok(AudioBuffer::new(Vec::new(), target_rate));
        }
        let samples = resample(&self.samples, self.sample_rate, target_rate)?;
        Ok(AudioBuffer::new(samples, target_rate))
    }
}

/// Resample mono audio from `from_rate` to `to_rate` using rubato.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| DubError::Audio(format!("Resampler init failed: {}", e)))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + chunk_size);
    let mut position = 0;

    // Keep feeding (zero padded past the end) until the delayed output covers everything
    while output.len() < expected + delay {
        let mut block = if position < samples.len() {
            samples[position..(position + chunk_size).min(samples.len())].to_vec()
        } else {
            Vec::new()
        };
        block.resize(chunk_size, 0.0);
        position += chunk_size;

        let resampled = resampler
            .process(&[block], None)
            .map_err(|e| DubError::Audio(format!("Resampling failed: {}", e)))?;
        if let Some(channel) = resampled.first() {
            output.extend_from_slice(channel);
        }
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    debug!("Resampled {} frames at {} Hz to {} frames at {} Hz", samples.len(), from_rate, output.len(), to_rate);
    Ok(output)
}

/// Decode WAV bytes into a mono buffer, averaging channels.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let mut reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| DubError::Audio(format!("Invalid WAV data: {}", e)))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DubError::Audio(format!("Failed to read WAV samples: {}", e)))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DubError::Audio(format!("Failed to read WAV samples: {}", e)))?
        }
    };

    let samples = if channels > 1 {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        interleaved
    };

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Encode a buffer as 16-bit mono PCM WAV.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + buffer.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| DubError::Audio(format!("Failed to start WAV writer: {}", e)))?;
        for &sample in &buffer.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer
                .write_sample(value)
                .map_err(|e| DubError::Audio(format!("Failed to write WAV sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| DubError::Audio(format!("Failed to finalize WAV: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

pub async fn read_wav_file<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    decode_wav(&bytes)
}

pub async fn write_wav_file<P: AsRef<Path>>(path: P, buffer: &AudioBuffer) -> Result<()> {
    let bytes = encode_wav(buffer)?;
    tokio::fs::write(path.as_ref(), bytes).await?;
    Ok(())
}

/// Silence detection parameters.
#[derive(Debug, Clone)]
pub struct SilenceParams {
    /// Frames this many dB below the loudest frame count as silent
    pub threshold_db: f64,
    pub min_silence: Duration,
    pub frame: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceInterval {
    pub start: Duration,
    pub end: Duration,
}

impl SilenceInterval {
    pub fn midpoint(&self) -> Duration {
        self.start + (self.end - self.start) / 2
    }
}

/// Find runs of low-energy frames lasting at least `min_silence`.
pub fn detect_silence(buffer: &AudioBuffer, params: &SilenceParams) -> Vec<SilenceInterval> {
    let frame_len = frames_for(params.frame, buffer.sample_rate).max(1);
    let levels: Vec<f64> = buffer
        .samples
        .chunks(frame_len)
        .map(|frame| {
            let energy = frame.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>() / frame.len() as f64;
            20.0 * (energy.sqrt() + 1e-10).log10()
        })
        .collect();

    let peak = levels.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let floor = peak - params.threshold_db;
    let min_frames = frames_for(params.min_silence, buffer.sample_rate);

    let mut intervals = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, level) in levels.iter().chain(std::iter::once(&f64::INFINITY)).enumerate() {
        match (run_start, *level < floor) {
            (None, true) => run_start = Some(i),
            (Some(first), false) => {
                let from = first * frame_len;
                let to = (i * frame_len).min(buffer.len());
                if to - from >= min_frames.max(1) {
                    intervals.push(SilenceInterval {
                        start: time_at(from, buffer.sample_rate),
                        end: time_at(to, buffer.sample_rate),
                    });
                }
                run_start = None;
            }
            _ => {}
        }
    }
    intervals
}
