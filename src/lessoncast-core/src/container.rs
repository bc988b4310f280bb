//! WAV container assembly and artifact output.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::error::{LessoncastError, Result};
use crate::synthesis::SynthesisResult;

/// Size of the canonical PCM header hound emits for mono/stereo 8-16 bit.
pub const CANONICAL_HEADER_LEN: usize = 44;

/// Raw PCM layout: interleaved little-endian signed integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioConfig::default().into()
    }
}

impl From<AudioConfig> for AudioFormat {
    fn from(config: AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bits_per_sample: config.bits_per_sample,
        }
    }
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample).div_ceil(8)
    }

    /// Bytes per frame (one sample for every channel).
    pub fn block_align(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    pub fn byte_rate(&self) -> u64 {
        u64::from(self.sample_rate) * self.block_align() as u64
    }

    /// Playback length of `payload_len` bytes of PCM.
    pub fn duration_of(&self, payload_len: usize) -> Duration {
        match self.byte_rate() {
            0 => Duration::ZERO,
            rate => Duration::from_secs_f64(payload_len as f64 / rate as f64),
        }
    }

    fn spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: SampleFormat::Int,
        }
    }
}

/// An assembled container, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioArtifact {
    pub bytes: Vec<u8>,
    pub header: WavHeader,
    pub format: AudioFormat,
}

impl AudioArtifact {
    pub fn payload_len(&self) -> usize {
        self.header.data_len as usize
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.payload_len())
    }
}

/// Header fields of a RIFF/WAVE file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    /// The `RIFF` chunk size (file length minus 8).
    pub riff_len: u32,
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Offset of the first payload byte.
    pub data_offset: usize,
    /// The `data` chunk size.
    pub data_len: u32,
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl WavHeader {
    /// Walk the RIFF chunks up to `data`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let malformed = |what: &str| LessoncastError::Assembly(format!("malformed WAV: {}", what));

        if bytes.get(0..4) != Some(b"RIFF".as_slice()) || bytes.get(8..12) != Some(b"WAVE".as_slice()) {
            return Err(malformed("missing RIFF/WAVE signature"));
        }
        let riff_len = read_u32(bytes, 4).ok_or_else(|| malformed("truncated RIFF header"))?;

        let mut fmt = None;
        let mut offset = 12;
        while offset + 8 <= bytes.len() {
            let id = &bytes[offset..offset + 4];
            let size = read_u32(bytes, offset + 4).ok_or_else(|| malformed("truncated chunk"))?;
            let body = offset + 8;

            match id {
                b"fmt " => {
                    let field = |at: usize| read_u16(bytes, body + at);
                    let wide = |at: usize| read_u32(bytes, body + at);
                    fmt = Some((
                        field(0).ok_or_else(|| malformed("truncated fmt"))?,
                        field(2).ok_or_else(|| malformed("truncated fmt"))?,
                        wide(4).ok_or_else(|| malformed("truncated fmt"))?,
                        wide(8).ok_or_else(|| malformed("truncated fmt"))?,
                        field(12).ok_or_else(|| malformed("truncated fmt"))?,
                        field(14).ok_or_else(|| malformed("truncated fmt"))?,
                    ));
                }
                b"data" => {
                    let (format_tag, channels, sample_rate, byte_rate, block_align, bits_per_sample) =
                        fmt.ok_or_else(|| malformed("data chunk before fmt chunk"))?;
                    return Ok(Self {
                        riff_len,
                        format_tag,
                        channels,
                        sample_rate,
                        byte_rate,
                        block_align,
                        bits_per_sample,
                        data_offset: body,
                        data_len: size,
                    });
                }
                _ => {}
            }

            // Chunks are word aligned.
            offset = body + size as usize + (size as usize & 1);
        }

        Err(malformed("no data chunk"))
    }
}

/// Concatenate chunk audio in chunk order and wrap it in a WAV container.
///
/// Results must already be ordered by chunk index; an out-of-order or empty
/// set is rejected rather than silently reordered.
pub fn assemble_wav(format: AudioFormat, results: &[SynthesisResult]) -> Result<AudioArtifact> {
    if results.is_empty() {
        return Err(LessoncastError::Assembly("no chunk audio to assemble".to_string()));
    }
    if let Some(pair) = results.windows(2).find(|w| w[0].chunk_index >= w[1].chunk_index) {
        return Err(LessoncastError::Assembly(format!(
            "chunk {} follows chunk {}",
            pair[1].chunk_index, pair[0].chunk_index
        )));
    }

    let block_align = format.block_align();
    if block_align == 0 || !matches!(format.bits_per_sample, 8 | 16 | 24 | 32) {
        return Err(LessoncastError::Assembly(format!(
            "unsupported PCM layout: {} channel(s), {} bits",
            format.channels, format.bits_per_sample
        )));
    }

    let payload: Vec<u8> = results.iter().flat_map(|r| r.pcm.iter().copied()).collect();
    if payload.is_empty() {
        return Err(LessoncastError::Assembly("chunk audio is empty".to_string()));
    }
    if payload.len() % block_align != 0 {
        return Err(LessoncastError::Assembly(format!(
            "payload of {} bytes is not a multiple of the {}-byte frame",
            payload.len(),
            block_align
        )));
    }

    let bytes = encode_wav(format, &payload)?;
    let header = WavHeader::parse(&bytes)?;
    check_invariants(&header, format, bytes.len(), &payload)?;

    debug!(
        chunks = results.len(),
        payload = payload.len(),
        file = bytes.len(),
        "WAV assembled"
    );

    Ok(AudioArtifact {
        bytes,
        header,
        format,
    })
}

fn hound_error(e: hound::Error) -> LessoncastError {
    LessoncastError::Assembly(format!("WAV encoding failed: {}", e))
}

fn encode_wav(format: AudioFormat, payload: &[u8]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(CANONICAL_HEADER_LEN + payload.len());
    let mut writer = WavWriter::new(Cursor::new(&mut bytes), format.spec()).map_err(hound_error)?;

    let width = format.bytes_per_sample();
    for sample in payload.chunks_exact(width) {
        let written = match sample {
            // 8-bit WAV is unsigned on disk; hound takes it signed.
            [b] => writer.write_sample((i16::from(*b) - 128) as i8),
            [lo, hi] => writer.write_sample(i16::from_le_bytes([*lo, *hi])),
            [a, b, c] => writer.write_sample(i32::from_le_bytes([0, *a, *b, *c]) >> 8),
            [a, b, c, d] => writer.write_sample(i32::from_le_bytes([*a, *b, *c, *d])),
            _ => {
                return Err(LessoncastError::Assembly(format!(
                    "unsupported sample width {}",
                    width
                )));
            }
        };
        written.map_err(hound_error)?;
    }

    writer.finalize().map_err(hound_error)?;
    Ok(bytes)
}

fn check_invariants(header: &WavHeader, format: AudioFormat, file_len: usize, payload: &[u8]) -> Result<()> {
    let fail = |what: String| Err(LessoncastError::Assembly(what));

    if header.riff_len as usize != file_len - 8 {
        return fail(format!(
            "RIFF size {} does not match file length {} - 8",
            header.riff_len, file_len
        ));
    }
    if header.data_len as usize != payload.len() {
        return fail(format!(
            "data size {} does not match payload length {}",
            header.data_len,
            payload.len()
        ));
    }
    if header.channels != format.channels
        || header.sample_rate != format.sample_rate
        || header.bits_per_sample != format.bits_per_sample
    {
        return fail(format!("header format {:?} does not match {:?}", header, format));
    }
    if usize::from(header.block_align) != format.block_align() {
        return fail(format!("block align {} != {}", header.block_align, format.block_align()));
    }
    if header.data_offset + payload.len() > file_len {
        return fail("payload runs past end of file".to_string());
    }

    Ok(())
}

/// Write `bytes` to `path` through a uniquely named sibling temp file so
/// readers never see a partial artifact and concurrent writers never share
/// a scratch file. Returns the size written.
pub fn write_artifact(path: &Path, bytes: &[u8]) -> Result<u64> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut tmp = scratch_file(path, dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    info!(path = %path.display(), bytes = bytes.len(), "artifact written");
    Ok(bytes.len() as u64)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

/// Hidden temp file next to `path`, removed on drop unless persisted.
fn scratch_file(path: &Path, dir: &Path) -> Result<NamedTempFile> {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    Ok(tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(dir)?)
}

/// Optional final step: WAV to MP3 with ffmpeg.
#[derive(Debug, Clone)]
pub struct Transcoder {
    program: PathBuf,
    bitrate: String,
}

impl Transcoder {
    pub fn new(bitrate: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            bitrate: bitrate.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Transcode `wav` next to itself as `.mp3`. The WAV is removed only once
    /// the MP3 is fully in place; on failure it is left untouched.
    pub async fn transcode(&self, wav: &Path) -> Result<PathBuf> {
        let mp3 = wav.with_extension("mp3");
        let tmp = scratch_file(&mp3, parent_dir(&mp3))?.into_temp_path();

        let output = tokio::process::Command::new(&self.program)
            .arg("-y")
            .args(["-loglevel", "error"])
            .arg("-i")
            .arg(wav)
            .args(["-codec:a", "libmp3lame", "-b:a", &self.bitrate, "-f", "mp3"])
            .arg(&*tmp)
            .output()
            .await
            .map_err(|e| {
                LessoncastError::Transcode(format!("cannot run {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            return Err(LessoncastError::Transcode(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tmp.persist(&mp3).map_err(|e| e.error)?;
        fs::remove_file(wav)?;
        info!(path = %mp3.display(), "transcoded to MP3");
        Ok(mp3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: usize, pcm: Vec<u8>) -> SynthesisResult {
        SynthesisResult {
            chunk_index: index,
            pcm,
            tokens: 0,
            attempts: 1,
        }
    }

    fn samples(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_header_matches_payload() {
        let results = vec![
            result(0, samples(&[1, 2, 3])),
            result(1, samples(&[-4, 5])),
            result(2, samples(&[i16::MIN, i16::MAX])),
        ];
        let artifact = assemble_wav(AudioFormat::default(), &results).unwrap();

        assert_eq!(artifact.bytes.len(), CANONICAL_HEADER_LEN + 14);
        assert_eq!(&artifact.bytes[0..4], b"RIFF");
        assert_eq!(&artifact.bytes[8..16], b"WAVEfmt ");
        assert_eq!(artifact.header.data_len, 14);
        assert_eq!(artifact.header.riff_len as usize, artifact.bytes.len() - 8);
        assert_eq!(artifact.header.format_tag, 1);
        assert_eq!(artifact.header.channels, 1);
        assert_eq!(artifact.header.sample_rate, 24_000);
        assert_eq!(artifact.header.byte_rate, 48_000);
        assert_eq!(artifact.header.block_align, 2);
        assert_eq!(artifact.header.bits_per_sample, 16);
    }

    #[test]
    fn test_payload_in_chunk_order() {
        let results = vec![result(0, samples(&[10, 11])), result(1, samples(&[20]))];
        let artifact = assemble_wav(AudioFormat::default(), &results).unwrap();

        let reader = hound::WavReader::new(Cursor::new(&artifact.bytes)).unwrap();
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![10, 11, 20]);
        assert_eq!(&artifact.bytes[artifact.header.data_offset..], samples(&[10, 11, 20]));
    }

    #[test]
    fn test_rejects_empty_input() {
        assert!(matches!(
            assemble_wav(AudioFormat::default(), &[]),
            Err(LessoncastError::Assembly(_))
        ));
        assert!(assemble_wav(AudioFormat::default(), &[result(0, Vec::new())]).is_err());
    }

    #[test]
    fn test_rejects_partial_frame() {
        let err = assemble_wav(AudioFormat::default(), &[result(0, vec![1, 2, 3])]).unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_rejects_out_of_order_chunks() {
        let results = vec![result(1, samples(&[1])), result(0, samples(&[2]))];
        assert!(assemble_wav(AudioFormat::default(), &results).is_err());
    }

    #[test]
    fn test_duration() {
        let pcm = vec![0u8; 48_000 * 3];
        let artifact = assemble_wav(AudioFormat::default(), &[result(0, pcm)]).unwrap();
        assert_eq!(artifact.duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WavHeader::parse(b"not a wav file at all").is_err());
        assert!(WavHeader::parse(b"RIFF\0\0\0\0WAVE").is_err());
    }

    #[test]
    fn test_write_artifact_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lesson.wav");

        let size = write_artifact(&path, b"payload").unwrap();
        assert_eq!(size, 7);
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("lesson.wav")]);

        write_artifact(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_concurrent_writers_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");

        std::thread::scope(|scope| {
            for writer in 0..4u8 {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..100 {
                        write_artifact(path, &[writer; 64]).unwrap();
                    }
                });
            }
        });

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|b| *b == bytes[0]));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_transcoder_failure_keeps_wav() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("lesson.wav");
        fs::write(&wav, b"RIFF").unwrap();

        let transcoder = Transcoder::new("128k").with_program("/nonexistent/ffmpeg");
        let err = transcoder.transcode(&wav).await.unwrap_err();

        assert!(matches!(err, LessoncastError::Transcode(_)));
        assert!(wav.exists());
        assert!(!wav.with_extension("mp3").exists());
    }
}
