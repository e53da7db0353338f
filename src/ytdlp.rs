use std::process::{Command, Stdio};
pub mod fetcher;
pub mod info;

pub struct YtDlp {
}

impl YtDlp {
    pub fn new() -> Self {
        YtDlp {  }
    }

    pub fn is_installed(&self) -> bool {
        let cmd = Command::new("yt-dlp")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match cmd {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }
}
