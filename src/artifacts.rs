use std::path::PathBuf;

/// A freshly downloaded, not-yet-transcoded audio file.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub source_format: String,
    pub remote_id: String,
    pub title: Option<String>,
    pub estimated_duration_seconds: Option<f64>,
}

/// Terminal artifact of a successful download. The caller owns it and is
/// responsible for deleting it.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscodedFile {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiskSpaceSample {
    pub free_bytes: u64,
}

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

impl DiskSpaceSample {
    pub fn gigabytes(&self) -> f64 {
        self.free_bytes as f64 / BYTES_PER_GB
    }
}
