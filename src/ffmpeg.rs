use std::process::{Command, Stdio};
pub mod probe;
pub mod transcoder;

pub struct FFmpeg {
}

impl FFmpeg {
    pub fn new() -> Self {
        FFmpeg {  }
    }

    pub fn is_installed(&self) -> bool {
        let cmd = Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match cmd {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }
}
