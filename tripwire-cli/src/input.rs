// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newline-delimited JSON snapshot input.
//!
//! One `AppInstanceMetrics` object per line. Blank lines and lines starting
//! with `#` are skipped.

use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};

use tripwire_core::AppInstanceMetrics;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to read snapshots: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: invalid snapshot: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse one input line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str, number: usize) -> Result<Option<AppInstanceMetrics>, InputError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| InputError::Parse {
            line: number,
            source,
        })
}

/// Open `path` for async line reading; `-` is stdin.
pub async fn open(path: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, InputError> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::new(BufReader::new(file)))
}
