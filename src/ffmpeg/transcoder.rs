use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::artifacts::TranscodedFile;
use crate::config::TranscodeOptions;
use crate::error::TranscodeError;
use crate::fstools::remove_file;
use crate::process::{self, ProcessError};

/// Converts a staged download into the PCM waveform the analysis reads.
///
/// Implementations must consume `staged`: it is gone after the call returns,
/// whatever the outcome, and a failed call leaves no target behind either.
pub trait FormatTranscoder {
    fn to_mono_pcm(&self, staged: &Path) -> Result<TranscodedFile, TranscodeError>;
}

pub struct FFmpegTranscoder {
    program: PathBuf,
    options: TranscodeOptions,
    timeout: Option<Duration>,
}

impl FFmpegTranscoder {
    pub fn new(options: TranscodeOptions) -> Self {
        FFmpegTranscoder {
            program: PathBuf::from("ffmpeg"),
            options,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn transcode(&self, source: &Path, destination: &Path) -> Result<TranscodedFile, TranscodeError> {
        let args = self.build_args(source, destination);
        debug!("{} {}", self.program.display(), args.iter().map(|s| format!("{:?}", s)).collect::<Vec<String>>().join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        let output = process::run(cmd, self.timeout).map_err(|err| match err {
            ProcessError::Spawn(source_err) | ProcessError::Wait(source_err) => TranscodeError::Io {
                path: PathBuf::from(source),
                source: source_err,
            },
            ProcessError::TimedOut(timeout) => TranscodeError::Timeout {
                path: PathBuf::from(source),
                timeout,
            },
        })?;

        if !output.status.success() {
            let reason = match output.status.code() {
                Some(code) => format!("ffmpeg exited with {:}", code),
                None => String::from("ffmpeg did not exit successfully."),
            };
            return Err(TranscodeError::for_file(&PathBuf::from(source), &reason, output.stderr.trim()));
        }

        verify_output(destination, &self.options)
    }

    fn build_args(&self, source: &Path, destination: &Path) -> Vec<PathBuf> {
        fn pbs(s: &str) -> PathBuf { PathBuf::from(s) }

        vec![
            pbs("-hide_banner"),
            pbs("-nostats"),
            pbs("-loglevel"), pbs("error"),
            // overwrite a stale target from an earlier attempt
            pbs("-y"),
            pbs("-i"), PathBuf::from(source),
            pbs("-vn"),
            pbs("-acodec"), pbs(&self.options.codec),
            pbs("-ar"), pbs(&self.options.sample_rate.to_string()),
            pbs("-ac"), pbs(&self.options.channels.to_string()),
            pbs("-f"), pbs(&self.options.container),
            PathBuf::from(destination),
        ]
    }
}

impl FormatTranscoder for FFmpegTranscoder {
    fn to_mono_pcm(&self, staged: &Path) -> Result<TranscodedFile, TranscodeError> {
        let destination = generate_output_filename(staged, self.options.extension());
        let result = self.transcode(staged, &destination);

        remove_file(staged);
        match &result {
            Ok(transcoded) => info!(path = %transcoded.path.display(), sample_rate = transcoded.sample_rate, "transcoded"),
            Err(_) => remove_file(&destination),
        }
        result
    }
}

/// Checks the header of a finished WAV target against what was asked for.
/// Other containers are trusted as-is.
fn verify_output(path: &Path, options: &TranscodeOptions) -> Result<TranscodedFile, TranscodeError> {
    let transcoded = TranscodedFile {
        path: PathBuf::from(path),
        sample_rate: options.sample_rate,
        channels: options.channels,
    };
    if !options.container.eq_ignore_ascii_case("wav") {
        return Ok(transcoded);
    }

    let format_error = |reason: String| TranscodeError::Format { path: PathBuf::from(path), reason };
    let reader = hound::WavReader::open(path).map_err(|e| format_error(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_rate != options.sample_rate {
        return Err(format_error(format!("sample rate {} != {}", spec.sample_rate, options.sample_rate)));
    }
    if spec.channels != options.channels {
        return Err(format_error(format!("{} channels != {}", spec.channels, options.channels)));
    }
    if options.codec == "pcm_s16le" && spec.bits_per_sample != 16 {
        return Err(format_error(format!("{} bits per sample != 16", spec.bits_per_sample)));
    }
    Ok(transcoded)
}

fn generate_output_filename(path: &Path, extension: &str) -> PathBuf {
    let same_extension = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false);
    if same_extension {
        path.with_extension(format!("pcm.{extension}"))
    } else {
        path.with_extension(extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::fs;
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16) {
        let spec = WavSpec { channels, sample_rate, bits_per_sample: 16, sample_format: SampleFormat::Int };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..(sample_rate as i32 / 10) {
            writer.write_sample((i % 100) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_generate_output_filename() {
        assert_eq!(generate_output_filename(Path::new("downloads/abc123.m4a"), "wav"), PathBuf::from("downloads/abc123.wav"));
        assert_eq!(generate_output_filename(Path::new("downloads/abc123.webm"), "wav"), PathBuf::from("downloads/abc123.wav"));
        assert_eq!(generate_output_filename(Path::new("downloads/abc123.wav"), "wav"), PathBuf::from("downloads/abc123.pcm.wav"));
    }

    #[test]
    fn test_build_args() {
        let transcoder = FFmpegTranscoder::new(TranscodeOptions::default());
        let args = transcoder.build_args(Path::new("downloads/abc123.m4a"), Path::new("downloads/abc123.wav"));
        let args: Vec<String> = args.iter().map(|a| a.display().to_string()).collect();
        let joined = args.join(" ");
        assert!(joined.contains("-y -i downloads/abc123.m4a"));
        assert!(joined.contains("-acodec pcm_s16le -ar 22050 -ac 1"));
        assert_eq!(args.last().map(String::as_str), Some("downloads/abc123.wav"));
    }

    #[test]
    fn test_verify_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc123.wav");
        write_wav(&path, 22050, 1);
        let transcoded = verify_output(&path, &TranscodeOptions::default()).unwrap();
        assert_eq!(transcoded.sample_rate, 22050);
        assert_eq!(transcoded.channels, 1);
    }

    #[test]
    fn test_verify_output_rejects_stereo() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc123.wav");
        write_wav(&path, 22050, 2);
        assert!(matches!(verify_output(&path, &TranscodeOptions::default()), Err(TranscodeError::Format { .. })));
    }

    #[test]
    fn test_verify_output_rejects_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc123.wav");
        fs::write(&path, b"RIFF").unwrap();
        assert!(matches!(verify_output(&path, &TranscodeOptions::default()), Err(TranscodeError::Format { .. })));
    }

    #[test]
    fn test_missing_program_removes_source() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("abc123.m4a");
        fs::write(&staged, b"audio").unwrap();

        let transcoder = FFmpegTranscoder::new(TranscodeOptions::default()).program("definitely-not-ffmpeg-4f1c");
        let result = transcoder.to_mono_pcm(&staged);

        assert!(matches!(result, Err(TranscodeError::Io { .. })));
        assert!(!staged.exists());
        assert!(!dir.path().join("abc123.wav").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_process_removes_source_and_partial_target() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("abc123.m4a");
        let partial = dir.path().join("abc123.wav");
        fs::write(&staged, b"audio").unwrap();
        fs::write(&partial, b"RIFF").unwrap();

        let transcoder = FFmpegTranscoder::new(TranscodeOptions::default()).program("false");
        let result = transcoder.to_mono_pcm(&staged);

        assert!(matches!(result, Err(TranscodeError::Process { .. })));
        assert!(!staged.exists());
        assert!(!partial.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_success_removes_source_and_keeps_target() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("abc123.m4a");
        let target = dir.path().join("abc123.wav");
        fs::write(&staged, b"audio").unwrap();
        // `true` ignores its arguments; the target stands in for ffmpeg's output
        write_wav(&target, 22050, 1);

        let transcoder = FFmpegTranscoder::new(TranscodeOptions::default()).program("true");
        let transcoded = transcoder.to_mono_pcm(&staged).unwrap();

        assert_eq!(transcoded.path, target);
        assert!(target.exists());
        assert!(!staged.exists());
    }
}
