use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use teal_core::{UploadRequest, UploadedFile};
use teal_server::cli::{AnalyzerArgs, ServeArgs};
use teal_server::web;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "teal-server", version)]
#[command(about = "HTTP front end for the Teal chromatogram trace analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web server
    Serve(ServeArgs),
    /// Run one trace through the analyzer and print the JSON response
    Analyze {
        /// Trace file to analyze
        #[arg(short, long, required_unless_present = "sample")]
        file: Option<PathBuf>,

        /// Analyze the bundled sample trace instead
        #[arg(long, conflicts_with = "file")]
        sample: bool,

        #[command(flatten)]
        analyzer: AnalyzerArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve(args) => web::start_server(args.into_config()).await,
        Commands::Analyze {
            file,
            sample,
            analyzer,
        } => analyze(file, sample, analyzer).await,
    }
}

/// `RUST_LOG` wins; otherwise info, or debug with --verbose
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn analyze(file: Option<PathBuf>, sample: bool, analyzer: AnalyzerArgs) -> Result<()> {
    let config = analyzer.into_config();
    config.validate()?;

    let request = match file {
        Some(path) if !sample => {
            let bytes = tokio::fs::read(&path).await?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            UploadRequest::with_file(UploadedFile::new(filename, bytes))
        }
        _ => UploadRequest::sample(),
    };

    info!(data_root = %config.data_root.display(), "Running one-off analysis");
    let service = web::build_service(config);
    let response = service.handle_upload(request).await;

    println!("{}", serde_json::to_string_pretty(&response.body)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
