pub mod artifacts;
pub mod batch;
pub mod config;
pub mod diskspace;
pub mod error;
pub mod features;
pub mod ffmpeg;
pub mod fstools;
pub mod input;
pub mod pipeline;
pub mod process;
pub mod results;
pub mod ytdlp;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use human_repr::HumanCount;
use rustop::opts;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use batch::{BatchOptions, BatchRunner, DefaultPipelineFactory};
use config::{PipelineConfig, UnknownSpacePolicy};
use diskspace::DiskSpaceGuard;
use features::BasicFeatureExtractor;
use fstools::{classify_file, DirEntryCategory};
use input::{read_rows, summarize};
use results::save_results;

fn main() -> ExitCode {
    let (args, _rest) = opts! {
        synopsis "Download the audio of a list of videos and extract acoustic features.";
        opt work_dir:String=String::from(config::DEFAULT_WORK_DIR), desc:"Working directory for downloads.";
        opt results_dir:String=String::from("results"), desc:"Directory for analysis_results.json and .csv.";
        opt max_retries:u32=pipeline::DEFAULT_MAX_RETRIES, desc:"Download attempts per video.";
        opt min_free_gb:f64=config::DEFAULT_MIN_FREE_GB, desc:"Minimum free space (GB) required before each download.";
        opt sample_rate:u32=config::DEFAULT_SAMPLE_RATE, desc:"Sample rate of the analyzed waveform.";
        opt format:String=String::from(config::DEFAULT_FORMAT_SELECTOR), desc:"yt-dlp format selector.";
        opt timeout:Option<u64>, desc:"Timeout in seconds for each yt-dlp, ffprobe and ffmpeg run.";
        opt jobs:usize=1, desc:"Number of videos processed concurrently.";
        opt keep_audio:bool=false, desc:"Keep the transcoded audio after analysis.";
        opt strict_space:bool=false, desc:"Refuse to download when free space can't be determined.";
        opt no_progress:bool=false, desc:"Don't render a progress bar.";
        param input:String, desc:"JSON file with rows of {url, views}.";
    }.parse_or_exit();

    init_tracing();

    if !ffmpeg::FFmpeg::new().is_installed() {
        error!("ffmpeg is not installed.");
        return ExitCode::FAILURE;
    }
    if !ytdlp::YtDlp::new().is_installed() {
        error!("yt-dlp is not installed.");
        return ExitCode::FAILURE;
    }

    let input_path = PathBuf::from(&args.input);
    match classify_file(&input_path) {
        DirEntryCategory::RegularFile | DirEntryCategory::SymbolicLink => (),
        DirEntryCategory::DoesNotExist => {
            error!("{:?} does not exist.", args.input);
            return ExitCode::FAILURE;
        },
        _ => {
            error!("{:?} is not a regular file.", args.input);
            return ExitCode::FAILURE;
        },
    }

    let config = PipelineConfig::default()
        .with_work_dir(&args.work_dir)
        .with_min_free_gb(args.min_free_gb)
        .with_sample_rate(args.sample_rate)
        .with_format_selector(args.format.clone())
        .with_process_timeout(args.timeout.map(Duration::from_secs))
        .with_unknown_space(if args.strict_space { UnknownSpacePolicy::Reject } else { UnknownSpacePolicy::Admit });

    match DiskSpaceGuard::default().sample(config.work_dir()) {
        Ok(sample) => info!(dir = %config.work_dir().display(), free = %sample.free_bytes.human_count_bytes(), "free space"),
        Err(err) => warn!(error = %err, "unable to determine free space"),
    }

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        // a second signal while stopping terminates immediately
        let registered = signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&stop))
            .and_then(|_| signal_hook::flag::register(signal, Arc::clone(&stop)));
        if let Err(err) = registered {
            warn!(signal, error = %err, "unable to register signal handler");
        }
    }

    info!("Reading video list from {}", input_path.display());
    let rows = match read_rows(&input_path) {
        Ok(rows) => rows,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        },
    };
    match summarize(&rows) {
        Some(s) => info!(
            videos = s.total,
            total_views = %s.total_views.human_count_bare(),
            average_views = %s.average_views.human_count_bare(),
            most_viewed = %s.max_views.human_count_bare(),
            least_viewed = %s.min_views.human_count_bare(),
            "Processing {} videos in total", s.total
        ),
        None => {
            warn!("No videos to process.");
            return ExitCode::SUCCESS;
        },
    }

    let options = BatchOptions {
        jobs: args.jobs,
        max_retries: args.max_retries,
        keep_audio: args.keep_audio,
        show_progress: !args.no_progress,
    };
    let runner = BatchRunner::new(
        config,
        options,
        Arc::new(DefaultPipelineFactory),
        Arc::new(BasicFeatureExtractor),
        stop,
    );
    let (records, summary) = runner.run(rows);

    info!(
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        skipped = summary.skipped,
        "Success rate: {:.1}%", summary.success_rate()
    );

    if records.is_empty() {
        warn!("No results to save!");
        return ExitCode::FAILURE;
    }

    match save_results(&PathBuf::from(&args.results_dir), &records) {
        Ok(saved) => {
            info!("Analysis completed! Results saved to {} and {}", saved.csv.display(), saved.json.display());
            ExitCode::SUCCESS
        },
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
