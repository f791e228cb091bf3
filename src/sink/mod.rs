//! # Spreadsheet Sinks
//!
//! This module writes finished listing rows into a spreadsheet-like store.
//! Every sink receives rows grouped per sheet, clears whatever the sheet held
//! before and then writes the new rows in bounded chunks.
//!
//! ## Implementations
//!
//! - **`WebhookSheetSink`**: posts JSON to a spreadsheet bridge (for example a
//!   script deployed next to the sheet). One `clear` request is followed by
//!   `append` requests carrying at most [`CHUNK_SIZE`] rows each.
//! - **`CsvSheetSink`**: writes `<sheet_id>.csv` into a local directory, useful
//!   for dry runs and for feeding other import tools.
//!
//! ## Row Layout
//!
//! Columns are fixed: `id` first, then every [`Field`] in declaration order.
//! Unresolved fields are written as empty cells so columns never shift.
//!
//! ## Environment Configuration
//!
//! - `SHEET_WEBHOOK_URL`: enables the webhook sink
//! - `CSV_OUTPUT_DIR`: enables the CSV sink

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Result, ScrapeError};
use crate::models::{Field, ListingRecord, RunResult};
use crate::traits::ClientConfig;

/// Maximum rows per write request.
pub const CHUNK_SIZE: usize = 500;

/// Header row of every sheet.
pub fn header() -> Vec<&'static str> {
    std::iter::once("id")
        .chain(Field::ALL.iter().map(|field| field.column()))
        .collect()
}

/// One spreadsheet row in column order.
pub fn row(record: &ListingRecord) -> Vec<String> {
    std::iter::once(record.id())
        .chain(
            Field::ALL
                .iter()
                .map(|field| record.get(*field).unwrap_or_default().to_string()),
        )
        .collect()
}

/// Destination for finished rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Replaces the contents of `sheet_id` with `rows`.
    async fn write_rows(&self, sheet_id: &str, rows: &[ListingRecord]) -> Result<()>;
}

/// Payload understood by the spreadsheet bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum SheetRequest<'a> {
    Clear {
        #[serde(rename = "sheetId")]
        sheet_id: &'a str,
        header: Vec<&'static str>,
    },
    Append {
        #[serde(rename = "sheetId")]
        sheet_id: &'a str,
        rows: Vec<Vec<String>>,
    },
}

/// Spreadsheet writer talking to an HTTP bridge.
///
/// The `reqwest::Client` is reused across requests so connections are pooled.
/// Any non-success status aborts the sheet and is reported as
/// [`ScrapeError::SinkWriteFailure`]; rows already appended stay in place.
#[derive(Clone)]
pub struct WebhookSheetSink {
    client: Client,
    webhook_url: String,
}

impl WebhookSheetSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    async fn send(&self, sheet_id: &str, request: &SheetRequest<'_>) -> Result<()> {
        let failure = |reason: String| ScrapeError::SinkWriteFailure {
            sheet_id: sheet_id.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(request)
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        if !response.status().is_success() {
            error!("Sheet bridge rejected write for {}: {}", sheet_id, response.status());
            return Err(failure(format!("bridge responded {}", response.status())));
        }

        Ok(())
    }
}

#[async_trait]
impl RowSink for WebhookSheetSink {
    async fn write_rows(&self, sheet_id: &str, rows: &[ListingRecord]) -> Result<()> {
        self.send(
            sheet_id,
            &SheetRequest::Clear {
                sheet_id,
                header: header(),
            },
        )
        .await?;

        for chunk in rows.chunks(CHUNK_SIZE) {
            let request = SheetRequest::Append {
                sheet_id,
                rows: chunk.iter().map(row).collect(),
            };
            self.send(sheet_id, &request).await?;
        }

        info!("Wrote {} rows to sheet {}", rows.len(), sheet_id);
        Ok(())
    }
}

/// Writes each sheet as `<dir>/<sheet_id>.csv`.
#[derive(Debug, Clone)]
pub struct CsvSheetSink {
    dir: PathBuf,
}

impl CsvSheetSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, sheet_id: &str) -> PathBuf {
        let name: String = sheet_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.csv"))
    }

    fn write_sync(&self, sheet_id: &str, rows: &[ListingRecord]) -> Result<()> {
        let failure = |reason: String| ScrapeError::SinkWriteFailure {
            sheet_id: sheet_id.to_string(),
            reason,
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| failure(e.to_string()))?;

        // File::create truncates, which clears the previous rows.
        let mut writer = csv::Writer::from_path(self.path(sheet_id)).map_err(|e| failure(e.to_string()))?;
        writer.write_record(header()).map_err(|e| failure(e.to_string()))?;

        for chunk in rows.chunks(CHUNK_SIZE) {
            for record in chunk {
                writer.write_record(row(record)).map_err(|e| failure(e.to_string()))?;
            }
            writer.flush().map_err(|e| failure(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl RowSink for CsvSheetSink {
    async fn write_rows(&self, sheet_id: &str, rows: &[ListingRecord]) -> Result<()> {
        let sink = self.clone();
        let sheet = sheet_id.to_string();
        let count = rows.len();
        let rows = rows.to_vec();

        tokio::task::spawn_blocking(move || sink.write_sync(&sheet, &rows))
            .await
            .map_err(|e| ScrapeError::SinkWriteFailure {
                sheet_id: sheet_id.to_string(),
                reason: e.to_string(),
            })??;

        info!("Wrote {} rows to {}", count, self.path(sheet_id).display());
        Ok(())
    }
}

/// Fans rows out to several sinks; the first failure is returned after all were tried.
pub struct MultiSink {
    sinks: Vec<Box<dyn RowSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn RowSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl RowSink for MultiSink {
    async fn write_rows(&self, sheet_id: &str, rows: &[ListingRecord]) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write_rows(sheet_id, rows).await {
                error!("Sink write failed for {}: {}", sheet_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Writes the rows of a run, one sheet at a time.
///
/// Rows go to their client's sheet, or `default_sheet` when the client has
/// none. Every sheet is attempted; the first failure is returned. Returns the
/// number of rows written.
pub async fn publish(
    sink: &dyn RowSink,
    clients: &[ClientConfig],
    result: &RunResult,
    default_sheet: Option<&str>,
) -> Result<usize> {
    let sheets: HashMap<&str, Option<&str>> = clients
        .iter()
        .map(|c| (c.id.as_str(), c.sheet_id.as_deref().or(default_sheet)))
        .collect();

    let mut grouped: BTreeMap<&str, Vec<ListingRecord>> = BTreeMap::new();
    let mut first_error = None;

    for record in &result.rows {
        match sheets.get(record.client_id.as_str()).copied().flatten() {
            Some(sheet) => grouped.entry(sheet).or_default().push(record.clone()),
            None => {
                first_error.get_or_insert_with(|| ScrapeError::SinkWriteFailure {
                    sheet_id: String::new(),
                    reason: format!("client {} has no sheet id and no default is set", record.client_id),
                });
            }
        }
    }

    if grouped.is_empty() {
        warn!("No rows to write");
    }

    let mut written = 0;
    for (sheet, rows) in grouped {
        match sink.write_rows(sheet, &rows).await {
            Ok(()) => written += rows.len(),
            Err(e) => {
                error!("Writing sheet {} failed: {}", sheet, e);
                first_error.get_or_insert(e);
            }
        }
    }

    first_error.map_or(Ok(written), Err)
}
