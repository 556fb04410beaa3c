//! Sequencing of the fetch, extract and convert stages

use crate::{
    archive::{self, ArchiveFile, ArchiveIndex, ArchiveState},
    config::Config,
    convert::{self, ConvertedTable},
    extract::{self, FlattenedArchive},
    fetch::{self, transport::Transport},
    progress::ProgressReport,
    Result,
};
use anyhow::Context;
use std::{fmt, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Pipeline stages to be run
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Stages {
    /// Download the archives
    pub fetch: bool,

    /// Flatten the archives on disk
    pub extract: bool,

    /// Convert the tables on disk
    pub convert: bool,
}
//
impl Stages {
    /// Every stage
    pub fn all() -> Self {
        Self {
            fetch: true,
            extract: true,
            convert: true,
        }
    }
}

/// Item that a stage failed to process, and why
#[derive(Debug)]
pub struct ItemFailure {
    /// Input file of the stage
    pub item: PathBuf,

    /// What went wrong
    pub error: anyhow::Error,
}

/// Outcome of a stage that processes input files one by one
#[derive(Debug)]
pub struct StageReport<T> {
    /// Results of the files that were processed successfully
    pub succeeded: Vec<T>,

    /// Files that could not be processed
    pub failed: Vec<ItemFailure>,
}
//
impl<T> StageReport<T> {
    /// Record the outcome of processing one input file
    pub fn record(&mut self, item: PathBuf, result: Result<T>) {
        match result {
            Ok(output) => self.succeeded.push(output),
            Err(error) => {
                log::error!("Failed to process {}: {error:#}", item.display());
                self.failed.push(ItemFailure { item, error });
            }
        }
    }
}
//
impl<T> Default for StageReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// What happened during a pipeline run, for each stage that ran
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Per-archive outcome of the fetch stage
    pub fetched: Option<Vec<ArchiveFile>>,

    /// Outcome of the extract stage
    pub extracted: Option<StageReport<FlattenedArchive>>,

    /// Outcome of the convert stage
    pub converted: Option<StageReport<ConvertedTable>>,
}
//
impl RunSummary {
    /// Number of items that could not be processed
    ///
    /// Archives whose download was never started or was interrupted don't
    /// count as failures.
    pub fn num_failures(&self) -> usize {
        let fetch_failures = self.fetched.iter().flatten().filter(|archive| {
            matches!(archive.state, ArchiveState::Failed(_))
        });
        fetch_failures.count()
            + self.extracted.as_ref().map_or(0, |report| report.failed.len())
            + self.converted.as_ref().map_or(0, |report| report.failed.len())
    }

    /// Truth that every item of every stage was processed successfully
    pub fn is_success(&self) -> bool {
        self.num_failures() == 0
    }
}
//
impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(archives) = &self.fetched {
            let (mut complete, mut failed, mut interrupted, mut pending) = (0, 0, 0, 0);
            for archive in archives {
                match archive.state {
                    ArchiveState::Complete { .. } => complete += 1,
                    ArchiveState::Failed(_) => failed += 1,
                    ArchiveState::Downloading => interrupted += 1,
                    ArchiveState::Pending => pending += 1,
                }
            }
            writeln!(
                f,
                "fetch: {complete} downloaded, {failed} failed, {interrupted} interrupted, {pending} not started"
            )?;
            for archive in archives {
                if let ArchiveState::Failed(e) = &archive.state {
                    writeln!(f, "  archive {}: {e}", archive.index)?;
                }
            }
        }
        if let Some(extracted) = &self.extracted {
            let claimed = extracted.succeeded.iter().map(|a| a.claimed.len()).sum::<usize>();
            let ignored = extracted.succeeded.iter().map(|a| a.ignored.len()).sum::<usize>();
            writeln!(
                f,
                "extract: {} archive(s) flattened into {claimed} new table(s), {ignored} duplicate(s) ignored, {} archive(s) failed",
                extracted.succeeded.len(),
                extracted.failed.len()
            )?;
            write_failures(f, &extracted.failed)?;
        }
        if let Some(converted) = &self.converted {
            let rows = converted.succeeded.iter().map(|t| t.rows).sum::<u64>();
            writeln!(
                f,
                "convert: {} table(s) converted ({rows} rows), {} table(s) failed",
                converted.succeeded.len(),
                converted.failed.len()
            )?;
            write_failures(f, &converted.failed)?;
        }
        Ok(())
    }
}

/// List the items that a stage failed to process
fn write_failures(f: &mut fmt::Formatter<'_>, failures: &[ItemFailure]) -> fmt::Result {
    for ItemFailure { item, error } in failures {
        writeln!(f, "  {}: {error:#}", item.display())?;
    }
    Ok(())
}

/// Run the selected stages, in fetch → extract → convert order
///
/// Each stage discovers its inputs from the local directories, so a stage can
/// be run on its own against the output of an earlier invocation. Archive
/// indices `0..max_idx` are downloaded by the fetch stage.
pub async fn run(
    config: Arc<Config>,
    stages: Stages,
    max_idx: u32,
    transport: Arc<dyn Transport>,
    report: &ProgressReport,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let layout = &config.layout;
    let mut summary = RunSummary::default();

    if stages.fetch {
        log::info!("Fetching {max_idx} archive(s) into {}", layout.raw_dir.display());
        let indices = (0..max_idx).map(ArchiveIndex);
        summary.fetched = Some(
            fetch::fetch_all(config.clone(), transport, indices, report, cancel.clone()).await?,
        );
    }

    if stages.extract && !cancel.is_cancelled() {
        tokio::fs::create_dir_all(&layout.raw_dir)
            .await
            .with_context(|| format!("creating archive directory {}", layout.raw_dir.display()))?;
        let archives = archive::discover(&config.source, &layout.raw_dir)?
            .into_iter()
            .map(|(_index, path)| path)
            .collect::<Vec<_>>();
        log::info!(
            "Flattening {} archive(s) into {}",
            archives.len(),
            layout.flatten_dir.display()
        );
        let flatten_dir = layout.flatten_dir.clone();
        let report = report.clone();
        let cancel = cancel.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract::flatten_all(&flatten_dir, archives, &report, &cancel)
        })
        .await
        .context("running the extraction stage")??;
        summary.extracted = Some(extracted);
    }

    if stages.convert && !cancel.is_cancelled() {
        tokio::fs::create_dir_all(&layout.flatten_dir)
            .await
            .with_context(|| format!("creating table directory {}", layout.flatten_dir.display()))?;
        let tables = convert::discover(&layout.flatten_dir, &config.convert.table_extension)?;
        log::info!(
            "Converting {} table(s) into {}",
            tables.len(),
            layout.dataset_dir.display()
        );
        summary.converted = Some(
            convert::convert_all(&config.convert, &layout.dataset_dir, tables, report, &cancel)
                .await?,
        );
    }

    Ok(summary)
}
