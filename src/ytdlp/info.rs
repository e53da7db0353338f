use std::path::PathBuf;
use serde::Deserialize;

/// The subset of yt-dlp's info JSON the fetcher cares about.
#[derive(Deserialize, Debug, PartialEq)]
pub struct VideoInfo {
    pub id: String,
    pub ext: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub requested_downloads: Vec<RequestedDownload>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct RequestedDownload {
    pub filepath: Option<PathBuf>,
}

impl VideoInfo {
    /// yt-dlp prints one JSON document per line; the last one describes
    /// the download that actually happened.
    pub fn from_stdout(stdout: &str) -> Result<Self, serde_json::Error> {
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        serde_json::from_str::<VideoInfo>(line)
    }

    pub fn reported_path(&self) -> Option<&PathBuf> {
        self.requested_downloads.first().and_then(|d| d.filepath.as_ref())
    }
}
