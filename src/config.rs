//! Processing pipeline configuration

use crate::Args;
use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

/// Archive URL of the April 2025 CNPJ data drop
pub const DEFAULT_URL_TEMPLATE: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/2025-04/Estabelecimentos{idx}.zip";

/// File name prefix of the establishment archives
pub const DEFAULT_ARCHIVE_PREFIX: &str = "Estabelecimentos";

/// Final process configuration
///
/// This is the result of digesting [`Args`]. Please refer to [`Args`] to know
/// more about individual fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Where archives come from and what they are called locally
    pub source: SourceConfig,

    /// Local directory layout
    pub layout: Layout,

    /// Download settings
    pub fetch: FetchConfig,

    /// Table conversion settings
    pub convert: ConvertConfig,
}
//
impl Config {
    /// Determine process configuration from CLI arguments
    pub(crate) fn new(args: Args) -> Arc<Self> {
        let Args {
            fetch: _,
            extract: _,
            convert: _,
            all: _,
            max_idx: _,
            concurrency,
            url_template,
            archive_prefix,
            raw_dir,
            flatten_dir,
            dataset_dir,
            table_extension,
            batch_rows,
            max_retries,
            retry_delay_ms,
            connect_timeout,
            request_timeout,
            stall_timeout,
        } = args;
        let secs = |s: NonZeroU32| Duration::from_secs(s.get().into());
        Arc::new(Self {
            source: SourceConfig {
                url_template,
                archive_prefix,
            },
            layout: Layout {
                flatten_dir: flatten_dir.unwrap_or_else(|| raw_dir.join("unzipped")),
                raw_dir,
                dataset_dir,
            },
            fetch: FetchConfig {
                concurrency,
                connect_timeout: secs(connect_timeout),
                request_timeout: request_timeout.map(secs),
                stall_timeout: secs(stall_timeout),
                retry: RetryPolicy {
                    max_retries,
                    initial_delay: Duration::from_millis(retry_delay_ms.get().into()),
                    ..RetryPolicy::default()
                },
            },
            convert: ConvertConfig {
                table_extension,
                batch_rows,
                ..ConvertConfig::default()
            },
        })
    }
}

/// Remote archive source
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SourceConfig {
    /// Archive URL, with an `{idx}` placeholder for the archive index
    pub url_template: Box<str>,

    /// Local archive name prefix, archives are named `{prefix}{idx}.zip`
    pub archive_prefix: Box<str>,
}
//
impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.into(),
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.into(),
        }
    }
}

/// Local directory layout
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Layout {
    /// Downloaded archives, one file per archive index
    pub raw_dir: PathBuf,

    /// Flattened archive contents, unique by file name
    pub flatten_dir: PathBuf,

    /// Parquet files, one per flattened table
    pub dataset_dir: PathBuf,
}

/// Download settings
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FetchConfig {
    /// Maximal number of simultaneous downloads
    pub concurrency: NonZeroUsize,

    /// Timeout for establishing a connection
    pub connect_timeout: Duration,

    /// Timeout for a whole request, including body download
    pub request_timeout: Option<Duration>,

    /// Maximal wait for the next chunk of a response body
    pub stall_timeout: Duration,

    /// What to do when a download fails in a transient way
    pub retry: RetryPolicy,
}
//
impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: NonZeroUsize::new(5).expect("5 is not 0"),
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
            stall_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded exponential backoff
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on the delay between two attempts
    pub max_delay: Duration,
}
//
impl RetryPolicy {
    /// Delay to be observed before retry number `retry` (starting at 1)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
//
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Table conversion settings
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConvertConfig {
    /// Extension of the flattened files that are tables
    pub table_extension: Box<str>,

    /// Field delimiter
    pub delimiter: u8,

    /// Number of rows per Parquet record batch
    pub batch_rows: NonZeroUsize,
}
//
impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            table_extension: "txt".into(),
            delimiter: b';',
            batch_rows: NonZeroUsize::new(65536).expect("65536 is not 0"),
        }
    }
}

#[cfg(test)]
impl Config {
    /// Configuration whose directories all live under `root`, fetching from
    /// the `mem://` URLs served by in-memory test transports
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            source: SourceConfig {
                url_template: "mem://archives/Estabelecimentos{idx}.zip".into(),
                ..SourceConfig::default()
            },
            layout: Layout {
                raw_dir: root.join("raw_data"),
                flatten_dir: root.join("raw_data").join("unzipped"),
                dataset_dir: root.join("parquet_data"),
            },
            fetch: FetchConfig {
                retry: RetryPolicy {
                    initial_delay: Duration::from_millis(1),
                    ..RetryPolicy::default()
                },
                ..FetchConfig::default()
            },
            convert: ConvertConfig::default(),
        }
    }
}
