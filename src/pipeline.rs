//! Download-and-convert pipeline.
//!
//! One `run` drives a single request through
//! `Idle → Gating → Fetching → Transcoding → Succeeded`, looping through
//! `RetryWait` on transient failures and ending in `Failed` once the
//! attempts are spent. Low disk space and malformed URLs end the request
//! immediately; they are not worth waiting for.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use human_repr::HumanDuration;
use tracing::{debug, error, info, warn};

use crate::artifacts::{StagedFile, TranscodedFile};
use crate::config::{PipelineConfig, UnknownSpacePolicy};
use crate::diskspace::{DiskSpaceGuard, SpaceProbe, SysinfoProbe};
use crate::error::{AttemptError, FetchError, PipelineError, SpaceQueryError};
use crate::ffmpeg::transcoder::{FFmpegTranscoder, FormatTranscoder};
use crate::fstools::{clear_directory, remove_file};
use crate::ytdlp::fetcher::{MediaFetcher, YtDlpFetcher};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub max_retries: u32,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        DownloadRequest {
            url: url.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// At least one attempt is always made.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PipelineState {
    Idle,
    Gating,
    Fetching,
    Transcoding,
    RetryWait,
    Succeeded,
    Failed,
}

/// Blocking delay between attempts, swappable so tests don't really wait.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

enum AttemptOutcome {
    Done(TranscodedFile),
    Transient(AttemptError, Option<StagedFile>),
    Fatal(PipelineError),
}

pub struct DownloadPipeline {
    config: PipelineConfig,
    fetcher: Box<dyn MediaFetcher>,
    transcoder: Box<dyn FormatTranscoder>,
    guard: DiskSpaceGuard,
    sleeper: Box<dyn Sleeper>,
}

impl DownloadPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let fetcher = YtDlpFetcher::new(config.work_dir(), config.fetch.clone())
            .timeout(config.process_timeout);
        let transcoder = FFmpegTranscoder::new(config.transcode.clone())
            .timeout(config.process_timeout);
        DownloadPipeline::with_components(
            config,
            Box::new(fetcher),
            Box::new(transcoder),
            Box::new(SysinfoProbe::new()),
            Box::new(ThreadSleeper),
        )
    }

    pub fn with_components(
        config: PipelineConfig,
        fetcher: Box<dyn MediaFetcher>,
        transcoder: Box<dyn FormatTranscoder>,
        probe: Box<dyn SpaceProbe>,
        sleeper: Box<dyn Sleeper>,
    ) -> Self {
        DownloadPipeline {
            config,
            fetcher,
            transcoder,
            guard: DiskSpaceGuard::new(probe),
            sleeper,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, request: &DownloadRequest) -> Result<TranscodedFile, PipelineError> {
        let attempts = request.max_retries.max(1);
        self.transition(request, PipelineState::Idle);

        let mut attempt = 0;
        loop {
            info!(url = %request.url, attempt = attempt + 1, of = attempts, "download attempt");

            let outcome = match self.admit(request) {
                Ok(()) => self.attempt(request),
                Err(err) => AttemptOutcome::Fatal(err),
            };

            let last_error = match outcome {
                AttemptOutcome::Done(transcoded) => {
                    self.transition(request, PipelineState::Succeeded);
                    return Ok(transcoded);
                },
                AttemptOutcome::Fatal(err) => {
                    self.transition(request, PipelineState::Failed);
                    error!(url = %request.url, error = %err, "download aborted");
                    return Err(err);
                },
                AttemptOutcome::Transient(err, staged) => {
                    warn!(url = %request.url, attempt = attempt + 1, of = attempts, error = %err, "download attempt failed");
                    self.discard_remnants(staged.as_ref());
                    err
                },
            };

            if attempt + 1 >= attempts {
                self.transition(request, PipelineState::Failed);
                error!(url = %request.url, attempts, "all download attempts failed");
                return Err(PipelineError::Exhausted {
                    url: request.url.clone(),
                    attempts,
                    last_error,
                });
            }

            let delay = self.backoff(attempt);
            self.transition(request, PipelineState::RetryWait);
            info!(url = %request.url, "retrying in {}", delay.human_duration());
            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }

    /// Delay before the attempt following `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }

    fn attempt(&self, request: &DownloadRequest) -> AttemptOutcome {
        self.transition(request, PipelineState::Fetching);
        let staged = match self.fetcher.fetch(&request.url) {
            Ok(staged) => staged,
            Err(FetchError::InvalidResource { url, reason }) => {
                return AttemptOutcome::Fatal(PipelineError::InvalidResource { url, reason });
            },
            Err(err) => return AttemptOutcome::Transient(err.into(), None),
        };

        debug!(
            id = %staged.remote_id,
            format = %staged.source_format,
            title = ?staged.title,
            duration = ?staged.estimated_duration_seconds,
            path = %staged.path.display(),
            "staged"
        );

        self.transition(request, PipelineState::Transcoding);
        match self.transcoder.to_mono_pcm(&staged.path) {
            Ok(transcoded) => AttemptOutcome::Done(transcoded),
            Err(err) => AttemptOutcome::Transient(err.into(), Some(staged)),
        }
    }

    /// Admission gate with a single remediation pass.
    fn admit(&self, request: &DownloadRequest) -> Result<(), PipelineError> {
        self.transition(request, PipelineState::Gating);
        let dir = self.config.work_dir();
        let min_gb = self.config.min_free_gb;

        match self.guard.ensure_space(dir, min_gb) {
            Ok(true) => return Ok(()),
            Ok(false) => {
                warn!(dir = %dir.display(), min_gb, "low disk space; clearing work dir");
                clear_directory(dir);
            },
            Err(err) => return self.unknown_space(dir, err),
        }

        match self.guard.ensure_space(dir, min_gb) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PipelineError::InsufficientSpace {
                dir: PathBuf::from(dir),
                free_gb: self.guard.free_space_gb(dir).unwrap_or(0.0),
                required_gb: min_gb,
            }),
            Err(err) => self.unknown_space(dir, err),
        }
    }

    fn unknown_space(&self, dir: &Path, err: SpaceQueryError) -> Result<(), PipelineError> {
        match self.config.unknown_space {
            UnknownSpacePolicy::Admit => {
                warn!(dir = %dir.display(), error = %err, "free space unknown; admitting anyway");
                Ok(())
            },
            UnknownSpacePolicy::Reject => Err(PipelineError::SpaceUnknown {
                dir: PathBuf::from(dir),
                source: err,
            }),
        }
    }

    /// Nothing from a failed attempt may outlive it: the staged file and
    /// any target derived from it both go.
    fn discard_remnants(&self, staged: Option<&StagedFile>) {
        if let Some(staged) = staged {
            remove_file(&staged.path);
            remove_file(&staged.path.with_extension(self.config.transcode.extension()));
            let pcm = format!("pcm.{}", self.config.transcode.extension());
            remove_file(&staged.path.with_extension(pcm));
        }
    }

    fn transition(&self, request: &DownloadRequest, state: PipelineState) {
        debug!(url = %request.url, ?state, "pipeline state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    use crate::error::TranscodeError;

    /// Replays scripted outcomes; `true` writes `{dir}/{id}.m4a`.
    struct ScriptedFetcher {
        dir: PathBuf,
        id: String,
        script: RefCell<VecDeque<Result<(), FetchError>>>,
        calls: Rc<RefCell<u32>>,
    }

    impl MediaFetcher for ScriptedFetcher {
        fn fetch(&self, url: &str) -> Result<StagedFile, FetchError> {
            *self.calls.borrow_mut() += 1;
            let next = self.script.borrow_mut().pop_front().unwrap_or_else(|| Err(FetchError::backend(url, "script exhausted")));
            next?;
            fs::create_dir_all(&self.dir).unwrap();
            let path = self.dir.join(format!("{}.m4a", self.id));
            fs::write(&path, b"m4a").unwrap();
            Ok(StagedFile {
                path,
                source_format: String::from("m4a"),
                remote_id: self.id.clone(),
                title: None,
                estimated_duration_seconds: None,
            })
        }
    }

    /// Behaves like the real transcoder with respect to the filesystem.
    struct FakeTranscoder {
        fail: RefCell<VecDeque<bool>>,
        calls: Rc<RefCell<u32>>,
    }

    impl FormatTranscoder for FakeTranscoder {
        fn to_mono_pcm(&self, staged: &Path) -> Result<TranscodedFile, TranscodeError> {
            *self.calls.borrow_mut() += 1;
            let target = staged.with_extension("wav");
            let fail = self.fail.borrow_mut().pop_front().unwrap_or(false);
            let _ = fs::remove_file(staged);
            if fail {
                return Err(TranscodeError::for_file(&PathBuf::from(staged), "ffmpeg exited with 1", "boom"));
            }
            fs::write(&target, b"RIFF").unwrap();
            Ok(TranscodedFile { path: target, sample_rate: 22050, channels: 1 })
        }
    }

    struct FixedProbe(Result<u64, ()>);

    impl SpaceProbe for FixedProbe {
        fn free_bytes(&self, path: &Path) -> Result<u64, SpaceQueryError> {
            self.0.map_err(|_| SpaceQueryError::NoVolume { path: PathBuf::from(path) })
        }
    }

    struct RecordingSleeper(Rc<RefCell<Vec<Duration>>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.0.borrow_mut().push(duration);
        }
    }

    struct Harness {
        dir: TempDir,
        fetch_calls: Rc<RefCell<u32>>,
        transcode_calls: Rc<RefCell<u32>>,
        sleeps: Rc<RefCell<Vec<Duration>>>,
        pipeline: DownloadPipeline,
    }

    fn harness(fetches: Vec<Result<(), FetchError>>, transcode_failures: Vec<bool>, free: Result<u64, ()>, policy: UnknownSpacePolicy) -> Harness {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("downloads");
        let fetch_calls = Rc::new(RefCell::new(0));
        let transcode_calls = Rc::new(RefCell::new(0));
        let sleeps = Rc::new(RefCell::new(Vec::new()));
        let config = PipelineConfig::default()
            .with_work_dir(&work_dir)
            .with_unknown_space(policy);
        let pipeline = DownloadPipeline::with_components(
            config,
            Box::new(ScriptedFetcher {
                dir: work_dir,
                id: String::from("abc123"),
                script: RefCell::new(fetches.into()),
                calls: Rc::clone(&fetch_calls),
            }),
            Box::new(FakeTranscoder { fail: RefCell::new(transcode_failures.into()), calls: Rc::clone(&transcode_calls) }),
            Box::new(FixedProbe(free)),
            Box::new(RecordingSleeper(Rc::clone(&sleeps))),
        );
        Harness { dir, fetch_calls, transcode_calls, sleeps, pipeline }
    }

    const PLENTY: Result<u64, ()> = Ok(10 << 30);
    const URL: &str = "https://video.example/abc123";

    fn network_down() -> Result<(), FetchError> {
        Err(FetchError::backend(URL, "connection reset"))
    }

    fn files_in(dir: &Path) -> Vec<String> {
        match fs::read_dir(dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect(),
            Err(_) => vec![],
        }
    }

    #[test]
    fn test_first_attempt_success() {
        let h = harness(vec![Ok(())], vec![], PLENTY, UnknownSpacePolicy::Admit);
        let transcoded = h.pipeline.run(&DownloadRequest::new(URL)).unwrap();

        assert!(transcoded.path.exists());
        assert_eq!(transcoded.sample_rate, 22050);
        assert_eq!(transcoded.channels, 1);
        assert!(!h.dir.path().join("downloads/abc123.m4a").exists());
        assert!(h.sleeps.borrow().is_empty());
    }

    #[test]
    fn test_succeeds_on_third_attempt_with_backoff() {
        let h = harness(vec![network_down(), network_down(), Ok(())], vec![], PLENTY, UnknownSpacePolicy::Admit);
        let transcoded = h.pipeline.run(&DownloadRequest::new(URL).max_retries(3)).unwrap();

        assert_eq!(transcoded.path, h.dir.path().join("downloads/abc123.wav"));
        assert!(!h.dir.path().join("downloads/abc123.m4a").exists());
        assert_eq!(*h.fetch_calls.borrow(), 3);
        assert_eq!(*h.sleeps.borrow(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn test_every_attempt_fails() {
        let h = harness(vec![network_down(), network_down(), network_down()], vec![], PLENTY, UnknownSpacePolicy::Admit);
        let err = h.pipeline.run(&DownloadRequest::new(URL).max_retries(3)).unwrap_err();

        match err {
            PipelineError::Exhausted { attempts, last_error, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, AttemptError::Fetch(_)));
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*h.fetch_calls.borrow(), 3);
        assert_eq!(h.sleeps.borrow().len(), 2);
        assert!(files_in(&h.dir.path().join("downloads")).iter().all(|f| !f.contains("abc123")));
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let h = harness(vec![network_down()], vec![], PLENTY, UnknownSpacePolicy::Admit);
        let err = h.pipeline.run(&DownloadRequest::new(URL).max_retries(1)).unwrap_err();

        assert!(matches!(err, PipelineError::Exhausted { attempts: 1, .. }));
        assert!(h.sleeps.borrow().is_empty());
        assert!(files_in(&h.dir.path().join("downloads")).is_empty());
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let h = harness(vec![Ok(())], vec![], PLENTY, UnknownSpacePolicy::Admit);
        let request = DownloadRequest { url: String::from(URL), max_retries: 0 };
        assert!(h.pipeline.run(&request).is_ok());
        assert_eq!(*h.fetch_calls.borrow(), 1);
    }

    #[test]
    fn test_transcode_failure_shares_attempt_counter() {
        let h = harness(vec![Ok(()), Ok(())], vec![true, false], PLENTY, UnknownSpacePolicy::Admit);
        let transcoded = h.pipeline.run(&DownloadRequest::new(URL).max_retries(2)).unwrap();

        assert!(transcoded.path.exists());
        assert_eq!(*h.fetch_calls.borrow(), 2);
        assert_eq!(*h.transcode_calls.borrow(), 2);
        assert_eq!(*h.sleeps.borrow(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_transcode_failures_exhaust_and_clean_up() {
        let h = harness(vec![Ok(()), Ok(())], vec![true, true], PLENTY, UnknownSpacePolicy::Admit);
        let err = h.pipeline.run(&DownloadRequest::new(URL).max_retries(2)).unwrap_err();

        match err {
            PipelineError::Exhausted { last_error, .. } => assert!(matches!(last_error, AttemptError::Transcode(_))),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(files_in(&h.dir.path().join("downloads")).is_empty());
    }

    #[test]
    fn test_insufficient_space_aborts_without_fetching() {
        let h = harness(vec![Ok(())], vec![], Ok(1 << 20), UnknownSpacePolicy::Admit);
        let work_dir = h.dir.path().join("downloads");
        fs::create_dir_all(&work_dir).unwrap();
        fs::write(work_dir.join("stale.m4a"), b"old").unwrap();

        let err = h.pipeline.run(&DownloadRequest::new(URL)).unwrap_err();

        assert!(matches!(err, PipelineError::InsufficientSpace { .. }));
        assert_eq!(*h.fetch_calls.borrow(), 0);
        assert!(h.sleeps.borrow().is_empty());
        // remediation ran before giving up
        assert!(!work_dir.join("stale.m4a").exists());
    }

    #[test]
    fn test_invalid_resource_is_not_retried() {
        let h = harness(vec![Err(FetchError::invalid("nope", "relative URL without a base"))], vec![], PLENTY, UnknownSpacePolicy::Admit);
        let err = h.pipeline.run(&DownloadRequest::new("nope")).unwrap_err();

        assert!(matches!(err, PipelineError::InvalidResource { .. }));
        assert_eq!(*h.fetch_calls.borrow(), 1);
        assert!(h.sleeps.borrow().is_empty());
    }

    #[test]
    fn test_unknown_space_admit() {
        let h = harness(vec![Ok(())], vec![], Err(()), UnknownSpacePolicy::Admit);
        assert!(h.pipeline.run(&DownloadRequest::new(URL)).is_ok());
    }

    #[test]
    fn test_unknown_space_reject() {
        let h = harness(vec![Ok(())], vec![], Err(()), UnknownSpacePolicy::Reject);
        let err = h.pipeline.run(&DownloadRequest::new(URL)).unwrap_err();
        assert!(matches!(err, PipelineError::SpaceUnknown { .. }));
        assert_eq!(*h.fetch_calls.borrow(), 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let h = harness(vec![], vec![], PLENTY, UnknownSpacePolicy::Admit);
        assert_eq!(h.pipeline.backoff(0), Duration::from_secs(1));
        assert_eq!(h.pipeline.backoff(1), Duration::from_secs(2));
        assert_eq!(h.pipeline.backoff(4), Duration::from_secs(16));
    }

    #[test]
    fn test_request_defaults() {
        let request = DownloadRequest::new(URL);
        assert_eq!(request.max_retries, 3);
        assert_eq!(request.max_retries(0).max_retries, 1);
    }
}
