use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::{DubError, Result};

/// One timestamped subtitle line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    pub index: usize,
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

impl Caption {
    /// Build a caption with millisecond timestamps and SRT-safe text.
    pub fn new<S: AsRef<str>>(index: usize, start: Duration, end: Duration, text: S) -> Self {
        Self {
            index,
            start: round_to_millis(start),
            end: round_to_millis(end),
            text: sanitize_text(text.as_ref()),
        }
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

pub fn round_to_millis(d: Duration) -> Duration {
    Duration::from_millis(((d.as_nanos() + 500_000) / 1_000_000) as u64)
}

/// Trim and drop blank lines, which would otherwise terminate the block.
fn sanitize_text(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Format a duration as an SRT timestamp (HH:MM:SS,mmm)
pub fn format_timestamp(d: Duration) -> String {
    let total_milliseconds = round_to_millis(d).as_millis() as u64;
    let hours = total_milliseconds / 3_600_000;
    let minutes = (total_milliseconds % 3_600_000) / 60_000;
    let secs = (total_milliseconds % 60_000) / 1_000;
    let millis = total_milliseconds % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Parse an SRT timestamp (HH:MM:SS,mmm; a '.' separator is tolerated)
pub fn parse_timestamp(s: &str) -> Option<Duration> {
    let (hms, millis) = s.trim().split_once([',', '.'])?;
    let mut parts = hms.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes = parse_fixed(parts.next()?, 2)?;
    let secs = parse_fixed(parts.next()?, 2)?;
    if parts.next().is_some() || minutes >= 60 || secs >= 60 {
        return None;
    }
    let millis = parse_fixed(millis, 3)?;
    Some(Duration::from_millis(
        hours * 3_600_000 + minutes * 60_000 + secs * 1_000 + millis,
    ))
}

fn parse_fixed(s: &str, digits: usize) -> Option<u64> {
    if s.len() != digits || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Serialize captions as SRT: `{index}\n{start} --> {end}\n{text}\n\n` per block
pub fn serialize_srt(captions: &[Caption]) -> String {
    let mut srt_content = String::new();

    for caption in captions {
        srt_content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            caption.index,
            format_timestamp(caption.start),
            format_timestamp(caption.end),
            caption.text
        ));
    }

    srt_content
}

/// Parse SRT content, rejecting blocks with a missing index, unreadable or
/// non-monotonic timestamps.
pub fn parse_srt(content: &str) -> Result<Vec<Caption>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let normalized = content.replace("\r\n", "\n");
    let mut lines = normalized.split('\n').peekable();
    let mut captions: Vec<Caption> = Vec::new();
    let mut block = 0;

    loop {
        // Skip separators between blocks
        while matches!(lines.peek(), Some(line) if line.trim().is_empty()) {
            lines.next();
        }
        let Some(index_line) = lines.next() else {
            break;
        };
        block += 1;

        let index: usize = index_line
            .trim()
            .parse()
            .map_err(|_| DubError::malformed(block, format!("missing index (found '{}')", index_line.trim())))?;

        let timing_line = lines
            .next()
            .ok_or_else(|| DubError::malformed(block, "missing timestamp line"))?;
        let (start, end) = parse_timing_line(timing_line)
            .ok_or_else(|| DubError::malformed(block, format!("invalid timestamp line '{}'", timing_line.trim())))?;

        if end <= start {
            return Err(DubError::malformed(
                block,
                format!("end {} is not after start {}", format_timestamp(end), format_timestamp(start)),
            ));
        }
        if let Some(previous) = captions.last() {
            if start < previous.end {
                return Err(DubError::malformed(
                    block,
                    format!(
                        "starts at {} before the previous caption ends at {}",
                        format_timestamp(start),
                        format_timestamp(previous.end)
                    ),
                ));
            }
        }

        let mut text_lines = Vec::new();
        match lines.next() {
            // Empty text: the blank text line is followed by the block separator
            Some(line) if line.is_empty() => {
                if matches!(lines.peek(), Some(next) if next.is_empty()) {
                    lines.next();
                }
            }
            Some(line) => {
                text_lines.push(line);
                while let Some(line) = lines.next() {
                    if line.is_empty() {
                        break;
                    }
                    text_lines.push(line);
                }
            }
            None => {}
        }

        captions.push(Caption {
            index,
            start,
            end,
            text: text_lines.join("\n"),
        });
    }

    Ok(captions)
}

fn parse_timing_line(line: &str) -> Option<(Duration, Duration)> {
    let (start, end) = line.split_once("-->")?;
    Some((parse_timestamp(start)?, parse_timestamp(end)?))
}

/// Write captions to an SRT file
pub async fn write_srt_file<P: AsRef<Path>>(captions: &[Caption], output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!("Generating SRT file: {}", output_path.display());

    fs::write(output_path, serialize_srt(captions)).await?;

    info!("SRT file generated with {} captions", captions.len());
    Ok(())
}

/// Read and parse an SRT file
pub async fn read_srt_file<P: AsRef<Path>>(path: P) -> Result<Vec<Caption>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DubError::FileNotFound(path.display().to_string()),
        _ => DubError::Io(e),
    })?;
    parse_srt(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(ms(0)), "00:00:00,000");
        assert_eq!(format_timestamp(ms(65_123)), "00:01:05,123");
        assert_eq!(format_timestamp(ms(3_661_500)), "01:01:01,500");
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:01:05,123"), Some(ms(65_123)));
        assert_eq!(parse_timestamp("01:01:01.500"), Some(ms(3_661_500)));
        assert_eq!(parse_timestamp("00:61:00,000"), None);
        assert_eq!(parse_timestamp("00:01:05,12"), None);
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn test_round_trip() {
        let captions = vec![
            Caption::new(1, ms(0), ms(1_500), "Olá, tudo bem?"),
            Caption::new(2, ms(1_500), ms(4_000), ""),
            Caption::new(3, ms(4_250), ms(7_000), "Primeira linha\nsegunda linha"),
            Caption::new(4, ms(3_600_000), ms(3_600_001), "fim"),
        ];
        let srt = serialize_srt(&captions);
        assert_eq!(parse_srt(&srt).unwrap(), captions);
    }

    #[test]
    fn test_serialized_layout() {
        let captions = vec![Caption::new(1, ms(10_000), ms(12_000), "Olá")];
        assert_eq!(serialize_srt(&captions), "1\n00:00:10,000 --> 00:00:12,000\nOlá\n\n");
    }

    #[test]
    fn test_parse_tolerates_crlf_and_bom() {
        let srt = "\u{feff}1\r\n00:00:01,000 --> 00:00:02,000\r\nHello\r\n\r\n2\r\n00:00:02,000 --> 00:00:03,000\r\nWorld\r\n";
        let captions = parse_srt(srt).unwrap();
        assert_eq!(captions.len(), 2);
        assert_eq!(captions[1].text, "World");
        assert_eq!(captions[1].start, ms(2_000));
    }

    #[test]
    fn test_missing_index_names_block() {
        let srt = "1\n00:00:01,000 --> 00:00:02,000\nok\n\n00:00:03,000 --> 00:00:04,000\nno index\n\n";
        match parse_srt(srt) {
            Err(DubError::MalformedSubtitle { block, .. }) => assert_eq!(block, 2),
            other => panic!("expected malformed subtitle, got {:?}", other),
        }
    }

    #[test]
    fn test_non_monotonic_timestamps_rejected() {
        let backwards = "1\n00:00:05,000 --> 00:00:04,000\nbackwards\n\n";
        assert!(matches!(
            parse_srt(backwards),
            Err(DubError::MalformedSubtitle { block: 1, .. })
        ));

        let overlapping = "1\n00:00:01,000 --> 00:00:03,000\na\n\n2\n00:00:02,000 --> 00:00:04,000\nb\n\n";
        assert!(matches!(
            parse_srt(overlapping),
            Err(DubError::MalformedSubtitle { block: 2, .. })
        ));
    }

    #[test]
    fn test_caption_new_sanitizes() {
        let caption = Caption::new(1, Duration::from_micros(1_499_600), ms(2_000), "  a\n\n b  \n");
        assert_eq!(caption.start, ms(1_500));
        assert_eq!(caption.text, "a\n b");
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.srt");
        let captions = vec![Caption::new(1, ms(0), ms(900), "um")];
        write_srt_file(&captions, &path).await.unwrap();
        assert_eq!(read_srt_file(&path).await.unwrap(), captions);
        assert!(matches!(
            read_srt_file(dir.path().join("missing.srt")).await,
            Err(DubError::FileNotFound(_))
        ));
    }
}
