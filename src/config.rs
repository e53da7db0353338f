use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WORK_DIR: &str = "downloads";
pub const DEFAULT_MIN_FREE_GB: f64 = 0.5;
pub const DEFAULT_SAMPLE_RATE: u32 = 22050;
pub const DEFAULT_FORMAT_SELECTOR: &str = "worstaudio";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// How the admission gate treats a volume whose free space can't be read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnknownSpacePolicy {
    Admit,
    Reject,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchOptions {
    pub format_selector: String,
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            format_selector: String::from(DEFAULT_FORMAT_SELECTOR),
            user_agent: String::from(DEFAULT_USER_AGENT),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranscodeOptions {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub container: String,
}

impl TranscodeOptions {
    pub fn extension(&self) -> &str {
        &self.container
    }
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        TranscodeOptions {
            codec: String::from("pcm_s16le"),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            container: String::from("wav"),
        }
    }
}

/// Everything a `DownloadPipeline` needs to know. Immutable once built, so
/// pipelines with different policies can run side by side.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub work_dir: PathBuf,
    pub min_free_gb: f64,
    pub backoff_base: Duration,
    /// Limit for each external process, not for the attempt as a whole.
    pub process_timeout: Option<Duration>,
    pub unknown_space: UnknownSpacePolicy,
    pub fetch: FetchOptions,
    pub transcode: TranscodeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            min_free_gb: DEFAULT_MIN_FREE_GB,
            backoff_base: Duration::from_secs(1),
            process_timeout: None,
            unknown_space: UnknownSpacePolicy::Admit,
            fetch: FetchOptions::default(),
            transcode: TranscodeOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_min_free_gb(mut self, min_free_gb: f64) -> Self {
        self.min_free_gb = min_free_gb;
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_unknown_space(mut self, policy: UnknownSpacePolicy) -> Self {
        self.unknown_space = policy;
        self
    }

    pub fn with_format_selector(mut self, selector: impl Into<String>) -> Self {
        self.fetch.format_selector = selector.into();
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.transcode.sample_rate = sample_rate;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Same policy, different directory. Used to give each worker its own.
    pub fn for_subdirectory(&self, name: &str) -> Self {
        self.clone().with_work_dir(self.work_dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.work_dir, PathBuf::from("downloads"));
        assert_eq!(config.min_free_gb, 0.5);
        assert_eq!(config.transcode.sample_rate, 22050);
        assert_eq!(config.transcode.channels, 1);
        assert_eq!(config.transcode.codec, "pcm_s16le");
        assert_eq!(config.fetch.format_selector, "worstaudio");
        assert_eq!(config.unknown_space, UnknownSpacePolicy::Admit);
    }

    #[test]
    fn test_builder() {
        let config = PipelineConfig::default()
            .with_work_dir("/tmp/dl")
            .with_sample_rate(16000)
            .with_process_timeout(Some(Duration::from_secs(30)));
        assert_eq!(config.work_dir(), Path::new("/tmp/dl"));
        assert_eq!(config.transcode.sample_rate, 16000);
        assert_eq!(config.process_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_for_subdirectory() {
        let config = PipelineConfig::default().for_subdirectory("worker-2");
        assert_eq!(config.work_dir, PathBuf::from("downloads/worker-2"));
    }
}
