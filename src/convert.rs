//! Conversion of flattened tables into Parquet files
//!
//! Tables are semicolon-separated text encoded in ISO-8859-1, with a header
//! row. Every field is kept as text, no type inference is attempted: the
//! output has one nullable string column per header cell, in header order,
//! where empty fields become nulls.

use crate::{
    config::ConvertConfig,
    pipeline::StageReport,
    progress::{ProgressReport, Work},
    Result,
};
use anyhow::Context;
use arrow::{
    array::{ArrayRef, RecordBatch, StringBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
};
use csv_async::{AsyncReaderBuilder, ByteRecord};
use futures::StreamExt;
use parquet::{arrow::AsyncArrowWriter, basic::Compression, file::properties::WriterProperties};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;

/// Summary of a table conversion
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConvertedTable {
    /// Source table
    pub table: PathBuf,

    /// Output Parquet file
    pub dataset: PathBuf,

    /// Number of columns
    pub columns: usize,

    /// Number of data rows
    pub rows: u64,
}

/// Find the tables of a directory, sorted by name
pub fn discover(flatten_dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let context = || format!("listing tables in {}", flatten_dir.display());
    let mut tables = Vec::new();
    for entry in std::fs::read_dir(flatten_dir).with_context(context)? {
        let entry = entry.with_context(context)?;
        let path = entry.path();
        if entry.file_type().with_context(context)?.is_file()
            && path.extension().is_some_and(|ext| ext == extension)
        {
            tables.push(path);
        }
    }
    tables.sort_unstable();
    log::debug!("Found {} table(s) in {}", tables.len(), flatten_dir.display());
    Ok(tables)
}

/// Location of the Parquet file associated with a table
pub fn dataset_path(dataset_dir: &Path, table: &Path) -> PathBuf {
    let file_name = table.file_name().map(Path::new).unwrap_or(table);
    dataset_dir.join(file_name.with_extension("parquet"))
}

/// Convert a sequence of tables, one after the other
///
/// A table that cannot be converted is reported as a failure, and the next
/// tables are still processed.
pub async fn convert_all(
    config: &ConvertConfig,
    dataset_dir: &Path,
    tables: Vec<PathBuf>,
    report: &ProgressReport,
    cancel: &CancellationToken,
) -> Result<StageReport<ConvertedTable>> {
    tokio::fs::create_dir_all(dataset_dir)
        .await
        .with_context(|| format!("creating dataset directory {}", dataset_dir.display()))?;
    let progress = report.add("Converting tables", Work::Steps(tables.len()));
    let mut outcome = StageReport::default();
    for table in tables {
        if cancel.is_cancelled() {
            log::warn!("Conversion interrupted before {}", table.display());
            break;
        }
        log::info!("Reading {}", table.display());
        let result = match convert(config, &table, dataset_dir, cancel).await {
            Ok(Some(converted)) => {
                log::info!(
                    "Saved {} ({} columns, {} rows)",
                    converted.dataset.display(),
                    converted.columns,
                    converted.rows
                );
                Ok(converted)
            }
            Ok(None) => {
                log::warn!("Conversion of {} was interrupted", table.display());
                break;
            }
            Err(e) => Err(e),
        };
        outcome.record(table, result);
        progress.make_progress(1);
    }
    progress.finish();
    Ok(outcome)
}

/// Convert a table into a Parquet file of `dataset_dir`
///
/// The output is written under a temporary name and only moved into place
/// once complete, so a failed or interrupted conversion does not leave a
/// truncated dataset. `None` is returned if the conversion was interrupted.
pub async fn convert(
    config: &ConvertConfig,
    table: &Path,
    dataset_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Option<ConvertedTable>> {
    let dataset = dataset_path(dataset_dir, table);
    let part = dataset.with_extension("parquet.part");
    match write_dataset(config, table, &part, cancel).await {
        Ok(Some((columns, rows))) => {
            tokio::fs::rename(&part, &dataset)
                .await
                .with_context(|| format!("moving {} into place", dataset.display()))?;
            Ok(Some(ConvertedTable {
                table: table.to_owned(),
                dataset,
                columns,
                rows,
            }))
        }
        Ok(None) => {
            remove_partial(&part).await;
            Ok(None)
        }
        Err(e) => {
            remove_partial(&part).await;
            Err(e)
        }
    }
}

/// Clean up after a conversion that did not complete
async fn remove_partial(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        log::debug!("Could not remove {}: {e}", part.display());
    }
}

/// Stream a table into a Parquet file, return its column and row counts
///
/// Cancellation is checked before each record batch is written out, and
/// results in `None`.
async fn write_dataset(
    config: &ConvertConfig,
    table: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<Option<(usize, u64)>> {
    // Set up the table reader
    let context = || format!("reading {}", table.display());
    let input = File::open(table).await.with_context(context)?;
    let mut reader = AsyncReaderBuilder::new()
        .delimiter(config.delimiter)
        .has_headers(true)
        .flexible(true)
        .create_reader(input);

    // Derive the output schema from the header
    let header = reader.byte_headers().await.with_context(context)?;
    anyhow::ensure!(!header.is_empty(), "{} has no header row", table.display());
    let schema: SchemaRef = Arc::new(Schema::new(
        column_names(header.iter())
            .into_iter()
            .map(|name| Field::new(name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));

    // Set up the Parquet writer
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let output_file = File::create(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;
    let mut writer = AsyncArrowWriter::try_new(output_file, schema.clone(), Some(properties))
        .context("preparing to write Parquet data")?;

    // Transfer rows one batch at a time
    let mut batch = BatchBuilder::new(schema.clone(), config.batch_rows.get());
    let mut records = reader.byte_records();
    let mut rows = 0u64;
    while let Some(record) = records.next().await {
        let record = record.with_context(context)?;
        batch.push(&record).with_context(context)?;
        rows += 1;
        if batch.is_full() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            writer
                .write(&batch.finish()?)
                .await
                .context("writing a Parquet record batch")?;
        }
    }
    if !batch.is_empty() {
        writer
            .write(&batch.finish()?)
            .await
            .context("writing the last Parquet record batch")?;
    }
    writer.close().await.context("finishing the Parquet file")?;
    Ok(Some((schema.fields().len(), rows)))
}

/// Accumulator for one record batch worth of rows
struct BatchBuilder {
    /// Output schema
    schema: SchemaRef,

    /// One builder per column
    columns: Vec<StringBuilder>,

    /// Number of rows after which the batch should be written out
    capacity: usize,

    /// Number of rows in the batch so far
    len: usize,

    /// Scratch buffer for text decoding
    decoded: String,
}
//
impl BatchBuilder {
    /// Prepare to accumulate rows
    fn new(schema: SchemaRef, capacity: usize) -> Self {
        Self {
            columns: (0..schema.fields().len())
                .map(|_| StringBuilder::new())
                .collect(),
            schema,
            capacity,
            len: 0,
            decoded: String::new(),
        }
    }

    /// Append a data row
    ///
    /// Missing trailing fields are treated as nulls, extra fields are an error.
    fn push(&mut self, record: &ByteRecord) -> Result<()> {
        anyhow::ensure!(
            record.len() <= self.columns.len(),
            "line {}: expected {} fields, saw {}",
            record.position().map_or(0, |position| position.line()),
            self.columns.len(),
            record.len()
        );
        for (idx, column) in self.columns.iter_mut().enumerate() {
            match record.get(idx) {
                Some(field) if !field.is_empty() => {
                    self.decoded.clear();
                    self.decoded.extend(decode_latin1(field));
                    column.append_value(&self.decoded);
                }
                _ => column.append_null(),
            }
        }
        self.len += 1;
        Ok(())
    }

    /// Truth that no row has been added since the last batch was taken out
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Truth that the batch has reached its target size
    fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Take out the accumulated rows as a record batch
    fn finish(&mut self) -> Result<RecordBatch> {
        self.len = 0;
        let columns = (self.columns.iter_mut())
            .map(|column| Arc::new(column.finish()) as ArrayRef)
            .collect();
        RecordBatch::try_new(self.schema.clone(), columns).context("assembling a record batch")
    }
}

/// Name the columns of a table from its header cells
///
/// Empty cells are named after their position and repeated names receive a
/// numeric suffix, so that every column gets a distinct non-empty name.
fn column_names<'a>(header: impl Iterator<Item = &'a [u8]>) -> Vec<String> {
    let mut seen = HashMap::<String, usize>::new();
    header
        .enumerate()
        .map(|(position, cell)| {
            let mut name = decode_latin1(cell).collect::<String>();
            if name.is_empty() {
                name = format!("Unnamed: {position}");
            }
            loop {
                let count = seen.get(&name).copied().unwrap_or(0);
                if count == 0 {
                    break;
                }
                seen.insert(name.clone(), count + 1);
                name = format!("{name}.{count}");
            }
            seen.insert(name.clone(), 1);
            name
        })
        .collect()
}

/// Decode ISO-8859-1 text, where each byte is the matching code point
fn decode_latin1(bytes: &[u8]) -> impl Iterator<Item = char> + '_ {
    bytes.iter().copied().map(char::from)
}
