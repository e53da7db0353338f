use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use human_repr::HumanCount;
use kdam::{term, tqdm, BarExt};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::AnalysisError;
use crate::features::{load_waveform, FeatureExtractor};
use crate::fstools::{clear_directory, clear_directory_retaining, remove_file};
use crate::input::InputRow;
use crate::pipeline::{DownloadPipeline, DownloadRequest};
use crate::results::AnalysisRecord;

/// Builds the pipeline a worker owns. Called once per worker, on the
/// worker's own thread.
pub trait PipelineFactory: Send + Sync {
    fn create(&self, config: PipelineConfig) -> DownloadPipeline;
}

pub struct DefaultPipelineFactory;

impl PipelineFactory for DefaultPipelineFactory {
    fn create(&self, config: PipelineConfig) -> DownloadPipeline {
        DownloadPipeline::new(config)
    }
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub jobs: usize,
    pub max_retries: u32,
    pub keep_audio: bool,
    pub show_progress: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            jobs: 1,
            max_retries: crate::pipeline::DEFAULT_MAX_RETRIES,
            keep_audio: false,
            show_progress: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn success_rate(&self) -> f64 {
        match self.total {
            0 => 0.0,
            total => self.successful as f64 / total as f64 * 100.0,
        }
    }
}

#[derive(Debug)]
enum BatchMessage {
    Started(usize, String),
    Finished(usize, Result<AnalysisRecord, AnalysisError>),
}

pub struct BatchRunner {
    config: PipelineConfig,
    options: BatchOptions,
    factory: Arc<dyn PipelineFactory>,
    extractor: Arc<dyn FeatureExtractor>,
    stop: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(
        config: PipelineConfig,
        options: BatchOptions,
        factory: Arc<dyn PipelineFactory>,
        extractor: Arc<dyn FeatureExtractor>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        BatchRunner { config, options, factory, extractor, stop }
    }

    /// Processes every row, stopping early only when the stop flag is
    /// raised. Records come back in input order.
    pub fn run(&self, rows: Vec<InputRow>) -> (Vec<AnalysisRecord>, BatchSummary) {
        let total = rows.len();
        let queue: Arc<Mutex<VecDeque<(usize, InputRow)>>> = Arc::new(Mutex::new(rows.into_iter().enumerate().collect()));
        let jobs = self.options.jobs.clamp(1, total.max(1));
        let (tx, rx) = mpsc::channel();

        let workers: Vec<_> = (0..jobs)
            .map(|index| {
                let worker = Worker {
                    config: self.worker_config(index, jobs),
                    max_retries: self.options.max_retries,
                    keep_audio: self.options.keep_audio,
                    factory: Arc::clone(&self.factory),
                    extractor: Arc::clone(&self.extractor),
                    queue: Arc::clone(&queue),
                    stop: Arc::clone(&self.stop),
                };
                let tx = tx.clone();
                thread::spawn(move || worker.forever(tx))
            })
            .collect();
        drop(tx);

        let mut pbar = if self.options.show_progress {
            term::init(false);
            Some(tqdm!(total = total, desc = "analyzing", position = 0, force_refresh = true))
        } else {
            None
        };

        let mut finished: Vec<(usize, AnalysisRecord)> = Vec::new();
        let mut summary = BatchSummary { total, ..BatchSummary::default() };
        for msg in rx {
            match msg {
                BatchMessage::Started(index, url) => {
                    info!(url = %url, "processing video {}/{}", index + 1, total);
                },
                BatchMessage::Finished(index, result) => {
                    match result {
                        Ok(record) => {
                            summary.successful += 1;
                            info!(url = %record.url, "successfully processed video {}/{}", index + 1, total);
                            finished.push((index, record));
                        },
                        Err(err) => {
                            summary.failed += 1;
                            error!(error = %err, "failed to process video {}/{}", index + 1, total);
                        },
                    }
                    if let Some(bar) = pbar.as_mut() {
                        bar.set_postfix(format!("ok={} failed={}", summary.successful, summary.failed));
                        let _ = bar.update(1);
                    }
                },
            }
        }

        for handle in workers {
            if handle.join().is_err() {
                error!("batch worker panicked");
            }
        }

        summary.skipped = total - summary.successful - summary.failed;
        if summary.skipped > 0 {
            warn!(skipped = summary.skipped, "stopped before every video was processed");
        }
        finished.sort_by_key(|(index, _)| *index);
        (finished.into_iter().map(|(_, record)| record).collect(), summary)
    }

    /// Concurrent workers each get their own subdirectory so one worker's
    /// housekeeping never deletes another's in-flight download.
    fn worker_config(&self, index: usize, jobs: usize) -> PipelineConfig {
        match jobs {
            1 => self.config.clone(),
            _ => self.config.for_subdirectory(&format!("worker-{}", index + 1)),
        }
    }
}

struct Worker {
    config: PipelineConfig,
    max_retries: u32,
    keep_audio: bool,
    factory: Arc<dyn PipelineFactory>,
    extractor: Arc<dyn FeatureExtractor>,
    queue: Arc<Mutex<VecDeque<(usize, InputRow)>>>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn forever(self, tx: Sender<BatchMessage>) {
        let pipeline = self.factory.create(self.config.clone());
        self.housekeeping(&pipeline);

        while !self.should_stop() {
            let Some((index, row)) = self.next_item() else { break };
            let _ = tx.send(BatchMessage::Started(index, row.url.clone()));
            let result = self.process(&pipeline, row);
            if tx.send(BatchMessage::Finished(index, result)).is_err() {
                break;
            }
        }

        self.housekeeping(&pipeline);
    }

    /// Clears the worker's directory. Transcoded audio survives when the
    /// caller asked to keep it.
    fn housekeeping(&self, pipeline: &DownloadPipeline) {
        let config = pipeline.config();
        if self.keep_audio {
            let kept = config.transcode.extension();
            clear_directory_retaining(config.work_dir(), |path| path.extension().is_some_and(|ext| ext == kept));
        } else {
            clear_directory(config.work_dir());
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn next_item(&self) -> Option<(usize, InputRow)> {
        match self.queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(_) => None,
        }
    }

    fn process(&self, pipeline: &DownloadPipeline, row: InputRow) -> Result<AnalysisRecord, AnalysisError> {
        let request = DownloadRequest::new(row.url.clone()).max_retries(self.max_retries);
        let transcoded = pipeline.run(&request)?;

        if let Ok(metadata) = std::fs::metadata(&transcoded.path) {
            info!(path = %transcoded.path.display(), size = %metadata.len().human_count_bytes(), "analyzing");
        }
        let loaded = load_waveform(&transcoded.path);
        if !self.keep_audio {
            remove_file(&transcoded.path);
        }
        let (samples, sample_rate) = loaded?;

        Ok(AnalysisRecord {
            url: row.url,
            views: row.views,
            features: self.extractor.extract(&samples, sample_rate),
        })
    }
}
