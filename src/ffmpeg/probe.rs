use std::path::Path;
use std::process::Command;
use std::time::Duration;
use serde::Deserialize;
use serde_json;

use crate::process;

#[derive(Deserialize, Debug)]
struct FFProbeJsonOutput {
    pub format: Option<FFProbeJsonFormat>,
}

#[derive(Deserialize, Debug)]
struct FFProbeJsonFormat {
    pub duration: Option<String>,
}

/// Asks ffprobe for the container duration. Any failure reads as "unknown".
pub fn probe_duration(path: &Path, timeout: Option<Duration>) -> Option<f64> {
    let mut cmd = Command::new("ffprobe");
    cmd.args(["-v", "error", "-of", "json", "-show_format"]).arg(path);
    match process::run(cmd, timeout) {
        Ok(output) if output.status.success() => parse_duration(&output.stdout),
        _ => None,
    }
}

fn parse_duration(json: &str) -> Option<f64> {
    let deserialized = serde_json::from_str::<FFProbeJsonOutput>(json).ok()?;
    deserialized.format?
        .duration?
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}
