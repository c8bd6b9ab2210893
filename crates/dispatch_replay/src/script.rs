//! JSON-lines replay scripts.
//!
//! One command per line, tagged by `op`. Rides are referred to by the alias
//! given in the `request` that created them, since real ride ids are only
//! known once the engine assigns them. Blank lines and lines starting with
//! `#` are skipped.
//!
//! ```text
//! {"op":"heartbeat","driver":"d1","lat":40.758,"lon":-73.9855}
//! {"op":"request","passenger":"p1","lat":40.758,"lon":-73.9855,"as":"r1","key":"tap-1"}
//! {"op":"subscribe","ride":"r1"}
//! {"op":"wait","secs":16}
//! {"op":"accept","ride":"r1","driver":"d2"}
//! ```

use std::io::BufRead;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Heartbeat {
        driver: String,
        lat: f64,
        lon: f64,
        #[serde(default)]
        accuracy: Option<f64>,
    },
    Request {
        passenger: String,
        lat: f64,
        lon: f64,
        #[serde(rename = "as")]
        alias: String,
        #[serde(default)]
        key: String,
    },
    Accept {
        ride: String,
        driver: String,
    },
    Start {
        ride: String,
    },
    Cancel {
        ride: String,
    },
    Complete {
        ride: String,
    },
    Subscribe {
        ride: String,
    },
    Show {
        ride: String,
    },
    Wait {
        secs: f64,
    },
    Prune,
    Telemetry,
}

/// A command plus the script line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub line: usize,
    pub command: Command,
}

pub fn parse_script(reader: impl BufRead) -> Result<Vec<Step>, ScriptError> {
    let mut steps = Vec::new();
    for (index, raw) in reader.lines().enumerate() {
        let raw = raw?;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = index + 1;
        let command = serde_json::from_str(trimmed)
            .map_err(|source| ScriptError::Parse { line, source })?;
        steps.push(Step { line, command });
    }
    Ok(steps)
}
