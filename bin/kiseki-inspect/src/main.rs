use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use kiseki::{
    correction::{TimestampCorrectionConfig, TimestampOffsetCorrector},
    mp4,
    segment::{fixed_uris, SegmentReference},
    ContentType,
};

#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
/// Reads an fMP4 init segment and media segment, then reports the track timescales, the base
/// media decode times and the timestamp offset correction for the given manifest values.
pub struct InspectArgs {
    /// Initialization segment containing `moov`.
    #[clap(short, long)]
    pub init: PathBuf,

    /// Media segment containing `moof`.
    pub media: PathBuf,

    /// Content type of the track: video, audio or text.
    #[clap(short = 't', long, default_value = "video")]
    pub content_type: String,

    /// Start time the manifest declares for the media segment, in seconds.
    #[clap(short, long, default_value_t = 0.)]
    pub start: f64,

    /// Timestamp offset the manifest declares for the media segment, in seconds.
    #[clap(short, long, default_value_t = 0., allow_hyphen_values = true)]
    pub offset: f64,

    /// Tolerated drift in seconds. Overrides the value from `--config`.
    #[clap(long)]
    pub max_discrepancy: Option<f64>,

    /// JSON file with a timestamp correction config, e.g. `{"maxTimestampDiscrepancy": 0.2}`.
    #[clap(long, env = "KISEKI_CORRECTION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print debug logs.
    #[clap(short, long)]
    pub verbose: bool,
}

fn load_config(args: &InspectArgs) -> anyhow::Result<TimestampCorrectionConfig> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => TimestampCorrectionConfig::default(),
    };
    // Inspecting is pointless with correction turned off.
    config.correct_timestamp_offset = true;
    if let Some(max) = args.max_discrepancy {
        config.max_timestamp_discrepancy = max;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = InspectArgs::parse();

    let default_level = if args.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let content_type = ContentType::from_mime_type(Some(&args.content_type))
        .ok_or_else(|| anyhow::anyhow!("Unknown content type: {}", args.content_type))?;
    let config = load_config(&args)?;

    let init = std::fs::read(&args.init)?;
    let media = std::fs::read(&args.media)?;

    let mut timescales: Vec<_> = mp4::parse_timescales(&init)?.into_iter().collect();
    timescales.sort_unstable();
    for (track_id, timescale) in &timescales {
        println!("track {track_id}: timescale {timescale}");
    }
    for time in mp4::parse_base_decode_times(&media)? {
        println!(
            "track {}: base media decode time {}",
            time.track_id, time.base_media_decode_time
        );
    }

    let mut corrector = TimestampOffsetCorrector::new(config);
    corrector.parse_timescales_from_init_segment(content_type, &init)?;

    let reference = Arc::new(
        SegmentReference::new(args.start, f64::INFINITY, fixed_uris(Vec::new()))
            .with_timestamp_offset(args.offset),
    );
    if corrector.check_timestamp_offset(content_type, &reference, &media) {
        println!(
            "timestamp offset corrected: {} -> {}",
            args.offset,
            reference.timestamp_offset()
        );
    } else {
        println!(
            "timestamp offset {} is within {}s",
            args.offset, config.max_timestamp_discrepancy
        );
    }

    tracing::debug!(?args, "Inspection finished");
    Ok(())
}
