use std::time::Duration;
use tracing::{debug, warn};

use super::{ChunkOutcome, ChunkResult};
use crate::chunker::SplitKind;
use crate::job::DegradedChunk;
use crate::subtitle::Caption;

/// Captions for the whole source, plus the chunks that had to be filled in
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedTranscript {
    pub captions: Vec<Caption>,
    pub degraded_chunks: Vec<DegradedChunk>,
}

impl CombinedTranscript {
    /// True when no chunk produced any text
    pub fn has_no_speech(&self) -> bool {
        self.captions.iter().all(|c| c.text.is_empty())
    }
}

/// Fold per-chunk transcripts into one caption list on the source timeline.
///
/// Segments are shifted by their chunk's offset, kept inside their chunk and
/// forced to start no earlier than the previous caption ends. When a chunk was
/// cut without a silence, the first caption of the next chunk is joined to the
/// last caption of this one if the gap between them is within `epsilon`, since
/// the cut most likely split a sentence. Degraded chunks become one empty
/// caption spanning the chunk.
pub fn combine_transcripts(results: &[ChunkResult], epsilon: Duration) -> CombinedTranscript {
    let mut ordered: Vec<&ChunkResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.span.index);

    let mut captions: Vec<Caption> = Vec::new();
    let mut degraded_chunks = Vec::new();
    // Set when the previous chunk ended in a hard cut and its last caption is
    // the last caption in the list
    let mut join_candidate = false;

    for result in ordered {
        let span = &result.span;
        let chunk_end = span.end();

        match &result.outcome {
            ChunkOutcome::Degraded(reason) => {
                let start = captions.last().map_or(span.offset, |c| c.end.max(span.offset));
                captions.push(Caption::new(0, start, chunk_end, ""));
                degraded_chunks.push(DegradedChunk {
                    index: span.index,
                    start: span.offset,
                    end: chunk_end,
                    reason: reason.clone(),
                });
                join_candidate = false;
            }
            ChunkOutcome::Transcribed(raw) => {
                let mut segments: Vec<_> = raw.segments.iter().filter(|s| !s.text.trim().is_empty()).collect();
                segments.sort_by_key(|s| s.start);

                let mut first = true;
                let mut emitted = false;
                for segment in segments {
                    let mut caption = Caption::new(
                        0,
                        span.offset + segment.start,
                        (span.offset + segment.end).min(chunk_end),
                        &segment.text,
                    );
                    if let Some(previous) = captions.last() {
                        caption.start = caption.start.max(previous.end);
                    }
                    if caption.end <= caption.start {
                        debug!(
                            "Dropping empty-range segment at {:.3}s in chunk {}",
                            caption.start.as_secs_f64(),
                            span.index + 1
                        );
                        continue;
                    }

                    let joins = first && join_candidate && {
                        let previous = &captions[captions.len() - 1];
                        caption.start - previous.end <= epsilon
                    };
                    first = false;
                    emitted = true;

                    if joins {
                        if let Some(previous) = captions.last_mut() {
                            debug!("Joining captions across the cut at {:.3}s", span.offset.as_secs_f64());
                            previous.end = caption.end;
                            previous.text = format!("{} {}", previous.text, caption.text);
                        }
                    } else {
                        captions.push(caption);
                    }
                }

                if !emitted && !raw.segments.is_empty() {
                    warn!("Chunk {} returned segments but no usable text", span.index + 1);
                }
                join_candidate = emitted && span.split == SplitKind::HardCut;
            }
        }
    }

    for (i, caption) in captions.iter_mut().enumerate() {
        caption.index = i + 1;
    }

    CombinedTranscript {
        captions,
        degraded_chunks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkSpan;
    use crate::transcribe::{RawTranscript, TranscriptSegment};

    fn secs(v: f64) -> Duration {
        Duration::from_secs_f64(v)
    }

    fn span(index: usize, offset: f64, duration: f64, split: SplitKind) -> ChunkSpan {
        ChunkSpan {
            index,
            offset: secs(offset),
            duration: secs(duration),
            split,
        }
    }

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start: secs(start),
            end: secs(end),
            text: text.to_string(),
        }
    }

    fn transcribed(span: ChunkSpan, segments: Vec<TranscriptSegment>) -> ChunkResult {
        ChunkResult {
            span,
            outcome: ChunkOutcome::Transcribed(RawTranscript {
                segments,
                language: None,
            }),
        }
    }

    fn assert_monotonic(captions: &[Caption]) {
        for (i, caption) in captions.iter().enumerate() {
            assert_eq!(caption.index, i + 1);
            assert!(caption.start < caption.end, "caption {} has an empty range", caption.index);
        }
        for pair in captions.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn test_offsets_are_applied() {
        let results = vec![
            transcribed(span(0, 0.0, 58.5, SplitKind::Silence), vec![seg(1.0, 4.0, "um"), seg(50.0, 58.0, "dois")]),
            transcribed(span(1, 58.5, 60.0, SplitKind::End), vec![seg(0.5, 3.25, "três")]),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert_monotonic(&combined.captions);
        assert_eq!(combined.captions.len(), 3);
        assert_eq!(combined.captions[2].start, secs(59.0));
        assert_eq!(combined.captions[2].end, secs(61.75));
        assert!(combined.degraded_chunks.is_empty());
    }

    #[test]
    fn test_subtracting_offset_gives_chunk_timestamps() {
        let results = vec![
            transcribed(span(0, 0.0, 41.5, SplitKind::Silence), vec![seg(0.25, 3.5, "a"), seg(20.0, 41.0, "b")]),
            transcribed(span(1, 41.5, 58.75, SplitKind::Silence), vec![seg(0.5, 12.125, "c")]),
            transcribed(
                span(2, 100.25, 19.75, SplitKind::End),
                vec![seg(1.0, 2.0, "d"), seg(4.5, 9.0, "e"), seg(10.0, 19.5, "f")],
            ),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert_monotonic(&combined.captions);
        assert_eq!(combined.captions.len(), 6);

        for caption in &combined.captions {
            let (result, raw) = results
                .iter()
                .find_map(|r| match &r.outcome {
                    ChunkOutcome::Transcribed(t) => t.segments.iter().find(|s| s.text == caption.text).map(|s| (r, s)),
                    ChunkOutcome::Degraded(_) => None,
                })
                .unwrap();
            assert_eq!(caption.start - result.span.offset, raw.start, "start of {}", caption.text);
            assert_eq!(caption.end - result.span.offset, raw.end, "end of {}", caption.text);
        }
    }

    #[test]
    fn test_degraded_chunk_becomes_placeholder() {
        let results = vec![
            transcribed(span(0, 0.0, 60.0, SplitKind::HardCut), vec![seg(0.0, 10.0, "primeiro")]),
            ChunkResult {
                span: span(1, 60.0, 60.0, SplitKind::HardCut),
                outcome: ChunkOutcome::Degraded("timed out twice".to_string()),
            },
            transcribed(span(2, 120.0, 30.0, SplitKind::End), vec![seg(2.0, 5.0, "terceiro")]),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert_monotonic(&combined.captions);

        assert_eq!(combined.captions.len(), 3);
        assert_eq!(combined.captions[0].text, "primeiro");
        let placeholder = &combined.captions[1];
        assert_eq!(placeholder.text, "");
        assert_eq!((placeholder.start, placeholder.end), (secs(60.0), secs(120.0)));
        assert_eq!(combined.captions[2].text, "terceiro");
        assert_eq!(combined.captions[2].start, secs(122.0));

        assert_eq!(combined.degraded_chunks.len(), 1);
        assert_eq!(combined.degraded_chunks[0].index, 1);
    }

    #[test]
    fn test_captions_split_by_hard_cut_are_joined() {
        let results = vec![
            transcribed(span(0, 0.0, 60.0, SplitKind::HardCut), vec![seg(55.0, 59.9, "uma frase que")]),
            transcribed(span(1, 60.0, 20.0, SplitKind::End), vec![seg(0.2, 2.0, "continua"), seg(3.0, 5.0, "outra")]),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert_monotonic(&combined.captions);
        assert_eq!(combined.captions.len(), 2);
        assert_eq!(combined.captions[0].text, "uma frase que continua");
        assert_eq!(combined.captions[0].end, secs(62.0));
        assert_eq!(combined.captions[1].index, 2);
    }

    #[test]
    fn test_no_join_after_silence_split() {
        let results = vec![
            transcribed(span(0, 0.0, 58.5, SplitKind::Silence), vec![seg(55.0, 58.4, "fim.")]),
            transcribed(span(1, 58.5, 20.0, SplitKind::End), vec![seg(0.1, 2.0, "Começo")]),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert_eq!(combined.captions.len(), 2);
    }

    #[test]
    fn test_overlaps_and_overruns_are_clamped() {
        let results = vec![
            transcribed(
                span(0, 0.0, 10.0, SplitKind::Silence),
                vec![seg(0.0, 4.0, "a"), seg(3.5, 6.0, "b"), seg(8.0, 12.0, "c")],
            ),
            transcribed(span(1, 10.0, 10.0, SplitKind::End), vec![seg(0.0, 1.0, "d"), seg(2.0, 2.0, "zero")]),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert_monotonic(&combined.captions);

        let texts: Vec<&str> = combined.captions.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
        assert_eq!(combined.captions[1].start, secs(4.0));
        assert_eq!(combined.captions[2].end, secs(10.0));
    }

    #[test]
    fn test_blank_segments_and_empty_chunks() {
        let results = vec![
            transcribed(span(0, 0.0, 10.0, SplitKind::HardCut), vec![seg(1.0, 2.0, "   ")]),
            transcribed(span(1, 10.0, 5.0, SplitKind::End), vec![]),
        ];
        let combined = combine_transcripts(&results, secs(0.5));
        assert!(combined.captions.is_empty());
        assert!(combined.has_no_speech());
    }
}
