//! Suijin Exportr - stream delimited rows to a gzipped CSV artifact,
//! locally or straight into S3.

use clap::Parser;
use std::path::PathBuf;
use suijin_exportr::config::ExportConfig;
use suijin_exportr::pipeline::Exporter;
use suijin_exportr::source::CsvReaderSource;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Suijin Exportr - csv.gz export pipeline with S3 multipart upload
#[derive(Parser, Debug)]
#[command(name = "suijin-exportr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Delimited input file; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Local output path (ignored with --upload)
    #[arg(short, long, default_value = "out.csv.gz")]
    output: PathBuf,

    /// Upload to the configured S3 destination instead of writing locally
    #[arg(short, long)]
    upload: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Suijin Exportr v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ExportConfig::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let input: Box<dyn std::io::Read + Send> = match &args.input {
        Some(path) => Box::new(std::fs::File::open(path)?),
        None => Box::new(std::io::stdin()),
    };
    let source = CsvReaderSource::new(input, config.delimiter_byte());

    let upload = args.upload;
    let exporter = Exporter::new(config);

    // Ctrl-C unwinds the pipeline and aborts any open session.
    let token = exporter.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling export");
            token.cancel();
        }
    });

    let rows = if upload {
        exporter.upload(source).await?
    } else {
        info!("writing artifact to {:?}", args.output);
        exporter.write_file(source, &args.output).await?
    };

    info!(rows, "export finished");
    Ok(())
}
