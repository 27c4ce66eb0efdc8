use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::{frames_for, time_at, AudioBuffer};
use crate::error::Result;
use crate::narration::NarrationSegment;

/// A segment that ran into the next caption and was cut short
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConflict {
    pub caption_index: usize,
    pub next_caption_index: usize,
    /// How far past the next caption's start the segment would have played
    pub overrun: Duration,
}

#[derive(Debug, Clone)]
pub struct TimelineSettings {
    pub sample_rate: u32,
    /// Silence kept before the next caption when a segment is cut short
    pub guard_gap: Duration,
}

#[derive(Debug)]
pub struct AssembledTrack {
    pub audio: AudioBuffer,
    pub conflicts: Vec<TimingConflict>,
}

/// Place every segment at its caption's start on one continuous track.
///
/// Gaps are filled with silence. A segment that would overlap the next one is
/// cut at the next start minus the guard gap. The track lasts until the later
/// of the source end and the last caption end, to the sample.
pub fn assemble(segments: &[NarrationSegment], source_duration: Duration, settings: &TimelineSettings) -> Result<AssembledTrack> {
    let rate = settings.sample_rate;
    let mut ordered: Vec<&NarrationSegment> = segments.iter().collect();
    ordered.sort_by_key(|s| (s.start, s.caption_index));

    let last_end = ordered.iter().map(|s| s.end()).max().unwrap_or(Duration::ZERO);
    let total = source_duration.max(last_end);
    let total_frames = frames_ceil(total, rate);
    let guard_frames = frames_for(settings.guard_gap, rate);

    let mut track = AudioBuffer::new(Vec::with_capacity(total_frames), rate);
    let mut conflicts = Vec::new();

    for (i, segment) in ordered.iter().enumerate() {
        let audio: Cow<AudioBuffer> = if segment.audio.sample_rate() == rate {
            Cow::Borrowed(&segment.audio)
        } else {
            Cow::Owned(segment.audio.resample_to(rate)?)
        };

        let cursor = track.len();
        let start = frames_for(segment.start, rate).max(cursor);
        track.append_silence_frames(start - cursor);

        let mut length = audio.len();
        if let Some(next) = ordered.get(i + 1) {
            let next_start = frames_for(next.start, rate);
            if start + length > next_start {
                let allowed = next_start.saturating_sub(guard_frames).max(start) - start;
                let overrun = time_at(start + length - next_start, rate);
                warn!(
                    "Narration for caption {} overruns caption {} by {:.3}s, cutting it short",
                    segment.caption_index,
                    next.caption_index,
                    overrun.as_secs_f64()
                );
                conflicts.push(TimingConflict {
                    caption_index: segment.caption_index,
                    next_caption_index: next.caption_index,
                    overrun,
                });
                length = allowed;
            }
        }
        length = length.min(total_frames.saturating_sub(start));

        track.append(&AudioBuffer::new(audio.samples()[..length].to_vec(), rate))?;
    }

    track.append_silence_frames(total_frames.saturating_sub(track.len()));
    info!(
        "Assembled {:.3}s narration track from {} segments ({} timing conflicts)",
        track.duration().as_secs_f64(),
        segments.len(),
        conflicts.len()
    );

    Ok(AssembledTrack { audio: track, conflicts })
}

/// Frames needed to cover all of `duration`
fn frames_ceil(duration: Duration, sample_rate: u32) -> usize {
    let nanos = duration.as_nanos() * sample_rate as u128;
    nanos.div_ceil(1_000_000_000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CaptionOutcome;

    const RATE: u32 = 8_000;

    fn settings() -> TimelineSettings {
        TimelineSettings {
            sample_rate: RATE,
            guard_gap: Duration::from_millis(40),
        }
    }

    fn segment(index: usize, start_ms: u64, window_ms: u64, audio_ms: u64, level: f32, rate: u32) -> NarrationSegment {
        let frames = frames_for(Duration::from_millis(audio_ms), rate);
        NarrationSegment {
            caption_index: index,
            start: Duration::from_millis(start_ms),
            target_duration: Duration::from_millis(window_ms),
            raw_duration: Duration::from_millis(audio_ms),
            outcome: CaptionOutcome::Fitted,
            failure: None,
            audio: AudioBuffer::new(vec![level; frames], rate),
        }
    }

    fn at(track: &AudioBuffer, ms: u64) -> f32 {
        track.samples()[frames_for(Duration::from_millis(ms), RATE)]
    }

    #[test]
    fn test_segments_land_at_caption_starts() {
        let segments = vec![
            segment(1, 1_000, 1_000, 1_000, 0.5, RATE),
            segment(2, 3_000, 500, 500, -0.5, RATE),
        ];
        let track = assemble(&segments, Duration::from_secs(5), &settings()).unwrap();

        assert!(track.conflicts.is_empty());
        assert_eq!(track.audio.len(), 5 * RATE as usize);
        assert_eq!(at(&track.audio, 500), 0.0);
        assert_eq!(at(&track.audio, 1_000), 0.5);
        assert_eq!(at(&track.audio, 1_999), 0.5);
        assert_eq!(at(&track.audio, 2_500), 0.0);
        assert_eq!(at(&track.audio, 3_200), -0.5);
        assert_eq!(at(&track.audio, 4_000), 0.0);
    }

    #[test]
    fn test_track_extends_to_last_caption() {
        let segments = vec![segment(1, 9_000, 3_000, 3_000, 0.5, RATE)];
        let track = assemble(&segments, Duration::from_secs(10), &settings()).unwrap();
        assert_eq!(track.audio.duration(), Duration::from_secs(12));
    }

    #[test]
    fn test_fractional_total_is_covered() {
        let track = assemble(&[], Duration::from_micros(1_000_050), &settings()).unwrap();
        assert!(track.audio.duration() >= Duration::from_micros(1_000_050));
        assert_eq!(track.audio.len(), 8_001);
    }

    #[test]
    fn test_overrun_is_cut_before_next_caption() {
        // First segment is 1.5 s long but the next caption starts after 1 s
        let segments = vec![
            segment(1, 0, 1_000, 1_500, 0.5, RATE),
            segment(2, 1_000, 1_000, 1_000, -0.5, RATE),
        ];
        let track = assemble(&segments, Duration::from_secs(2), &settings()).unwrap();

        assert_eq!(track.conflicts.len(), 1);
        let conflict = &track.conflicts[0];
        assert_eq!((conflict.caption_index, conflict.next_caption_index), (1, 2));
        assert_eq!(conflict.overrun, Duration::from_millis(500));

        assert_eq!(at(&track.audio, 959), 0.5);
        assert_eq!(at(&track.audio, 970), 0.0);
        assert_eq!(at(&track.audio, 1_000), -0.5);
        assert_eq!(track.audio.len(), 2 * RATE as usize);
    }

    #[test]
    fn test_other_sample_rates_are_converted() {
        let segments = vec![segment(1, 0, 1_000, 1_000, 0.5, 16_000)];
        let track = assemble(&segments, Duration::from_secs(2), &settings()).unwrap();
        assert_eq!(track.audio.sample_rate(), RATE);
        assert_eq!(track.audio.len(), 2 * RATE as usize);
        assert!(at(&track.audio, 500) > 0.4);
    }
}
