use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::artifacts::StagedFile;
use crate::config::FetchOptions;
use crate::error::FetchError;
use crate::ffmpeg::probe::probe_duration;
use crate::fstools::remove_file;
use crate::process::{self, ProcessError};
use crate::ytdlp::info::VideoInfo;

/// Downloads the audio of one remote resource into a staging file.
///
/// A single attempt: retrying is the caller's business. On failure nothing
/// written during the attempt is left in the work dir.
pub trait MediaFetcher {
    fn fetch(&self, url: &str) -> Result<StagedFile, FetchError>;
}

pub struct YtDlpFetcher {
    program: PathBuf,
    work_dir: PathBuf,
    options: FetchOptions,
    timeout: Option<Duration>,
}

impl YtDlpFetcher {
    pub fn new(work_dir: impl Into<PathBuf>, options: FetchOptions) -> Self {
        YtDlpFetcher {
            program: PathBuf::from("yt-dlp"),
            work_dir: work_dir.into(),
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

    fn download(&self, url: &str) -> Result<StagedFile, FetchError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.build_args(url));

        let output = process::run(cmd, self.timeout).map_err(|err| match err {
            ProcessError::Spawn(source) | ProcessError::Wait(source) => FetchError::Io {
                url: String::from(url),
                source,
            },
            ProcessError::TimedOut(timeout) => FetchError::Timeout {
                url: String::from(url),
                timeout,
            },
        })?;

        if !output.status.success() {
            // the info line is printed before the download starts
            if let Ok(info) = VideoInfo::from_stdout(&output.stdout) {
                self.discard_stale(&info.id);
            }
            return Err(classify_failure(url, output.status.code(), &output.stderr));
        }

        let info = VideoInfo::from_stdout(&output.stdout)
            .map_err(|err| FetchError::backend(url, &format!("malformed info JSON: {}", err)))?;
        let path = self.locate(&info)
            .ok_or_else(|| FetchError::backend(url, &format!("no staged file for {:?}", info.id)))?;

        let estimated_duration_seconds = match info.duration {
            Some(d) => Some(d),
            None => probe_duration(&path, self.timeout),
        };

        info!(
            url,
            id = %info.id,
            title = info.title.as_deref().unwrap_or("Unknown Title"),
            duration = ?estimated_duration_seconds,
            format = %info.ext,
            "downloaded"
        );

        Ok(StagedFile {
            path,
            source_format: info.ext,
            remote_id: info.id,
            title: info.title,
            estimated_duration_seconds,
        })
    }

    /// The staging path is `{work_dir}/{id}.{ext}`; fall back to what
    /// yt-dlp says it wrote if the two ever disagree.
    fn locate(&self, info: &VideoInfo) -> Option<PathBuf> {
        let expected = self.work_dir.join(format!("{}.{}", info.id, info.ext));
        if expected.is_file() {
            return Some(expected);
        }
        match info.reported_path() {
            Some(reported) if reported.is_file() => {
                warn!(expected = %expected.display(), reported = %reported.display(), "staged file is not where expected");
                Some(reported.clone())
            },
            _ => None,
        }
    }

    /// Removes `{id}.*` from the work dir, partial downloads included.
    fn discard_stale(&self, id: &str) {
        if !is_plausible_id(id) {
            return;
        }
        let prefix = format!("{}.", id);
        for path in snapshot(&self.work_dir) {
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix));
            if matches {
                debug!(path = %path.display(), "removing stale download");
                remove_file(&path);
            }
        }
    }

    fn build_args(&self, url: &str) -> Vec<String> {
        let template = self.work_dir.join("%(id)s.%(ext)s");
        // '%' in the directory itself must not be read as a template field
        let template = template.display().to_string();
        let dir_len = template.len() - "%(id)s.%(ext)s".len();
        let template = format!("{}{}", template[..dir_len].replace('%', "%%"), &template[dir_len..]);

        vec![
            String::from("--format"), self.options.format_selector.clone(),
            String::from("--output"), template,
            String::from("--add-header"), format!("User-Agent:{}", self.options.user_agent),
            String::from("--quiet"),
            String::from("--no-warnings"),
            String::from("--no-progress"),
            String::from("--no-playlist"),
            String::from("--force-overwrites"),
            String::from("--dump-json"),
            String::from("--no-simulate"),
            String::from("--"),
            String::from(url),
        ]
    }
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(&self, url: &str) -> Result<StagedFile, FetchError> {
        let parsed = validate_url(url)?;
        let url = parsed.as_str();

        fs::create_dir_all(&self.work_dir).map_err(|source| FetchError::Io {
            url: String::from(url),
            source,
        })?;

        let before = snapshot(&self.work_dir);
        let result = self.download(url);
        if let Err(err) = &result {
            for leftover in snapshot(&self.work_dir).difference(&before) {
                debug!(path = %leftover.display(), error = %err, "removing partial download");
                remove_file(leftover);
            }
            if let Some(id) = guess_remote_id(&parsed) {
                self.discard_stale(&id);
            }
        }
        result
    }
}

pub fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(raw.trim()).map_err(|err| FetchError::invalid(raw, &err.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => (),
        other => return Err(FetchError::invalid(raw, &format!("unsupported scheme {:?}", other))),
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err(FetchError::invalid(raw, "missing host")),
    }
}

/// The id yt-dlp is likely to assign: YouTube's `v` parameter, otherwise
/// the stem of the last path segment.
pub fn guess_remote_id(url: &Url) -> Option<String> {
    let from_query = url.query_pairs().find(|(key, _)| key == "v").map(|(_, value)| value.into_owned());
    let id = from_query.or_else(|| {
        url.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .and_then(|segment| segment.split('.').next())
            .map(String::from)
    })?;
    is_plausible_id(&id).then_some(id)
}

fn is_plausible_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn classify_failure(url: &str, code: Option<i32>, stderr: &str) -> FetchError {
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();

    if stderr.contains("Unsupported URL") {
        return FetchError::invalid(url, detail);
    }

    match code {
        Some(code) => FetchError::backend(url, &format!("yt-dlp exited with {}: {}", code, detail)),
        None => FetchError::backend(url, &format!("yt-dlp did not exit successfully: {}", detail)),
    }
}

fn snapshot(dir: &Path) -> HashSet<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => HashSet::new(),
    }
}
