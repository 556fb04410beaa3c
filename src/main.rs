//! This program mirrors the Brazilian CNPJ open data drop published by the
//! Receita Federal, whose general documentation you can find at
//! <https://dados.gov.br/dados/conjuntos-dados/cadastro-nacional-da-pessoa-juridica---cnpj>.
//!
//! It works in three stages: fetch the numbered "Estabelecimentos" zip
//! archives, flatten their contents into one directory, then convert the
//! resulting semicolon-separated tables into Parquet files.

mod archive;
mod config;
mod convert;
mod extract;
mod fetch;
mod pipeline;
mod progress;
#[cfg(test)]
mod test_helpers;

use crate::{
    config::Config,
    fetch::transport::HttpTransport,
    pipeline::Stages,
    progress::ProgressReport,
};
use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    sync::Arc,
};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Download, flatten and convert the CNPJ establishment archives
///
/// When no stage flag is given, all stages are run. Stages always run in the
/// fetch → extract → convert order, and each stage works from whatever the
/// previous stages left on disk.
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    /// Download the zip archives
    #[arg(long)]
    fetch: bool,

    /// Flatten the downloaded archives into the table directory
    #[arg(long)]
    extract: bool,

    /// Convert the flattened tables into Parquet files
    #[arg(long)]
    convert: bool,

    /// Run every stage (this is also what happens without any stage flag)
    #[arg(long)]
    all: bool,

    /// Number of archives to download, starting from index 0
    #[arg(short = 'n', long, default_value = "10")]
    max_idx: u32,

    /// Maximal number of simultaneous downloads
    #[arg(short, long, default_value = "5")]
    concurrency: NonZeroUsize,

    /// Remote archive URL, where `{idx}` stands for the archive index
    #[arg(long, default_value = config::DEFAULT_URL_TEMPLATE)]
    url_template: Box<str>,

    /// Name of local archives, before the index and `.zip` extension
    #[arg(long, default_value = config::DEFAULT_ARCHIVE_PREFIX)]
    archive_prefix: Box<str>,

    /// Directory where downloaded archives are stored
    #[arg(long, default_value = "raw_data")]
    raw_dir: PathBuf,

    /// Directory where archive contents are flattened
    ///
    /// Defaults to the `unzipped` subdirectory of the raw data directory.
    #[arg(long)]
    flatten_dir: Option<PathBuf>,

    /// Directory where Parquet files are written
    #[arg(long, default_value = "parquet_data")]
    dataset_dir: PathBuf,

    /// Extension of the flattened files that should be converted
    #[arg(long, default_value = "txt")]
    table_extension: Box<str>,

    /// Number of table rows that are buffered before being written out
    ///
    /// Tables are converted in a streaming fashion, so this bounds the memory
    /// footprint of the conversion stage. Larger batches compress better.
    #[arg(long, default_value = "65536")]
    batch_rows: NonZeroUsize,

    /// Number of times a transient download failure is retried
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Delay before the first download retry, in milliseconds
    ///
    /// Each subsequent retry doubles the delay, up to 30 seconds.
    #[arg(long, default_value = "1000")]
    retry_delay_ms: NonZeroU32,

    /// Timeout for establishing a connection, in seconds
    #[arg(long, default_value = "30")]
    connect_timeout: NonZeroU32,

    /// Timeout for a whole download, in seconds (default: none)
    ///
    /// Archives are large, so this is off by default and the stall timeout is
    /// what protects against hung servers.
    #[arg(long)]
    request_timeout: Option<NonZeroU32>,

    /// Maximal wait for the next chunk of a download, in seconds
    #[arg(long, default_value = "120")]
    stall_timeout: NonZeroU32,
}
//
impl Args {
    /// Decode and validate CLI arguments
    pub fn parse_and_check() -> Result<Self> {
        // Decode CLI arguments
        let args = Args::parse();

        // Check CLI arguments for basic sanity
        anyhow::ensure!(
            args.url_template.contains(archive::INDEX_PLACEHOLDER),
            "the URL template must contain the {} placeholder",
            archive::INDEX_PLACEHOLDER
        );
        anyhow::ensure!(
            !args.archive_prefix.is_empty() && !args.archive_prefix.contains('/'),
            "the archive prefix must be a non-empty file name"
        );
        anyhow::ensure!(
            !args.table_extension.is_empty() && !args.table_extension.starts_with('.'),
            "the table extension must be given without its leading dot"
        );
        Ok(args)
    }

    /// Stages that the user asked for
    pub fn stages(&self) -> Stages {
        let any_selected = self.fetch || self.extract || self.convert;
        if self.all || !any_selected {
            Stages::all()
        } else {
            Stages {
                fetch: self.fetch,
                extract: self.extract,
                convert: self.convert,
            }
        }
    }
}
//
#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    setup_logging().map_err(|e| anyhow::format_err!("{e}"))?;

    // Decode CLI arguments
    let args = Args::parse_and_check()?;
    let stages = args.stages();
    let max_idx = args.max_idx;
    let config = Config::new(args);

    // Wind down when the user hits Ctrl+C, exit right away on a second one
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            log::warn!("Interrupted, cleaning up partial outputs (hit Ctrl+C again to exit now)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                log::error!("Interrupted again, exiting immediately");
                std::process::exit(130);
            }
        }
    });

    // Run the requested pipeline stages
    let report = ProgressReport::new();
    let transport = Arc::new(HttpTransport::new(&config.fetch).context("setting up the HTTP client")?);
    let summary = pipeline::run(config, stages, max_idx, transport, &report, cancel).await?;

    // Tell the user how it went
    {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        stdout.write_all(summary.to_string().as_bytes()).await?;
        stdout.flush().await?;
    }
    anyhow::ensure!(
        summary.is_success(),
        "{} item(s) failed, see logs for details",
        summary.num_failures()
    );
    Ok(())
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Set up logging
fn setup_logging() -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}
