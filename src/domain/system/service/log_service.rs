use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::api::dto::system_dto::PaginatedLogResponse;
use crate::errors::AppError;

/// File name prefix of the daily rolling log; files are `<prefix>.<YYYY-MM-DD>`.
pub const LOG_FILE_PREFIX: &str = "kubedeck.log";

const DEFAULT_LIMIT: usize = 200;

/// Read access to the rolling log files written by the file layer.
pub struct LogService {
    dir: PathBuf,
}

impl LogService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Dates with a log file, newest first.
    pub async fn get_system_log_file_list(&self) -> Result<Vec<String>> {
        let mut dates = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dates),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.dir.display()));
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
                .and_then(|rest| rest.strip_prefix('.'))
            else {
                continue;
            };
            if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok() {
                dates.push(date.to_string());
            }
        }

        dates.sort_unstable_by(|a, b| b.cmp(a));
        Ok(dates)
    }

    /// Lines `[cursor, cursor + limit)` of one day's log.
    pub async fn get_system_log_lines(
        &self,
        date: &str,
        cursor: Option<usize>,
        limit: Option<usize>,
    ) -> Result<PaginatedLogResponse> {
        // Only a real date may reach the filesystem.
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| AppError::BodyParsingError(format!("invalid log date '{date}'")))?;

        let path = self.dir.join(format!("{LOG_FILE_PREFIX}.{date}"));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("no log file for {date}")).into());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        let cursor = cursor.unwrap_or(0);
        let limit = limit.unwrap_or(DEFAULT_LIMIT).max(1);
        let total = content.lines().count();
        let lines: Vec<String> = content
            .lines()
            .skip(cursor)
            .take(limit)
            .map(str::to_string)
            .collect();
        let next = cursor + lines.len();

        Ok(PaginatedLogResponse {
            date: date.to_string(),
            lines,
            next_cursor: (next < total).then_some(next),
        })
    }
}
