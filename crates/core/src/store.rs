//! Persistence of winning shape → kernel configuration mappings.
//!
//! The backing table is keyed by the full problem shape and kept in
//! insertion order so the output file is reproducible and diffable. The
//! on-disk format is a flat CSV, one row per shape:
//!
//! ```text
//! M,N,K,indtype,outdtype,bias,scaleAB,family,candidate,latency_ns
//! ```
//!
//! `flush` writes the whole table through a sibling temp file and renames it
//! into place, so an interrupted run never leaves a corrupt or truncated
//! tuned file behind.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::catalog::KernelFamily;
use crate::dtype::DtypeKind;
use crate::error::TuneError;
use crate::shape::ProblemShape;

pub const CSV_HEADER: &str = "M,N,K,indtype,outdtype,bias,scaleAB,family,candidate,latency_ns";

/// Winning kernel choice for one shape. Created at the end of a successful
/// search; overwritten only by a later re-tune of the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningResult {
    pub shape: ProblemShape,
    pub family: KernelFamily,
    pub candidate_id: String,
    pub latency_ns: f64,
}

/// In-memory result table with optional file binding.
#[derive(Debug)]
pub struct ResultStore {
    path: Option<PathBuf>,
    rows: Vec<TuningResult>,
    index: HashMap<ProblemShape, usize>,
}

impl ResultStore {
    /// Unbound store; `flush` is a no-op until a path is attached.
    pub fn new() -> Self {
        Self {
            path: None,
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Empty store bound to `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new()
        }
    }

    /// Store bound to `path`, preloaded with any rows already in the file.
    /// A missing file is an empty store, so first runs and incremental
    /// re-runs share one code path.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, TuneError> {
        let path = path.into();
        let mut store = Self::with_path(path.clone());
        if !path.is_file() {
            return Ok(store);
        }
        let text = fs::read_to_string(&path).map_err(|source| TuneError::Io {
            path: path.clone(),
            source,
        })?;
        for (idx, line) in text.lines().enumerate() {
            if idx == 0 || line.trim().is_empty() {
                continue;
            }
            store.upsert(parse_row(line, idx + 1)?);
        }
        info!(path = %path.display(), rows = store.len(), "loaded tuned results");
        Ok(store)
    }

    /// Merge a result into the table. A later result for the same shape
    /// replaces the prior entry in place rather than duplicating it.
    pub fn upsert(&mut self, result: TuningResult) {
        match self.index.get(&result.shape) {
            Some(&idx) => self.rows[idx] = result,
            None => {
                self.index.insert(result.shape, self.rows.len());
                self.rows.push(result);
            }
        }
    }

    pub fn contains(&self, shape: &ProblemShape) -> bool {
        self.index.contains_key(shape)
    }

    pub fn get(&self, shape: &ProblemShape) -> Option<&TuningResult> {
        self.index.get(shape).map(|&idx| &self.rows[idx])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TuningResult> {
        self.rows.iter()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the table to the bound path. No-op when unbound.
    ///
    /// The table is written to a sibling temp file which is fsynced and
    /// renamed over the target, so every exit path leaves either the old
    /// file or a complete new one.
    pub fn flush(&self) -> Result<(), TuneError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        let persist = |source| TuneError::Persistence {
            path: path.clone(),
            source,
        };
        {
            let mut file = fs::File::create(&tmp).map_err(persist)?;
            writeln!(file, "{CSV_HEADER}").map_err(persist)?;
            for row in &self.rows {
                writeln!(file, "{}", render_row(row)).map_err(persist)?;
            }
            file.sync_all().map_err(persist)?;
        }
        fs::rename(&tmp, path).map_err(persist)?;
        Ok(())
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

fn render_row(row: &TuningResult) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        row.shape.m,
        row.shape.n,
        row.shape.k,
        row.shape.indtype,
        row.shape.outdtype,
        row.shape.bias,
        row.shape.scale_ab,
        row.family,
        row.candidate_id,
        row.latency_ns,
    )
}

fn parse_row(line: &str, lineno: usize) -> Result<TuningResult, TuneError> {
    let malformed = |reason: String| TuneError::MalformedRow {
        line: lineno,
        reason,
    };
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 10 {
        return Err(malformed(format!(
            "expected 10 columns, got {}",
            fields.len()
        )));
    }
    let dim = |field: &str, name: &str| {
        field
            .parse::<usize>()
            .map_err(|_| malformed(format!("invalid {name} '{field}'")))
    };
    let m = dim(fields[0], "M")?;
    let n = dim(fields[1], "N")?;
    let k = dim(fields[2], "K")?;
    let indtype = DtypeKind::parse(fields[3])?;
    let outdtype = DtypeKind::parse(fields[4])?;
    let bias = parse_bool(fields[5]).ok_or_else(|| malformed(format!("invalid bias '{}'", fields[5])))?;
    let scale_ab = parse_bool(fields[6])
        .ok_or_else(|| malformed(format!("invalid scaleAB '{}'", fields[6])))?;
    let family = KernelFamily::parse(fields[7])
        .ok_or_else(|| malformed(format!("unknown kernel family '{}'", fields[7])))?;
    let latency_ns = fields[9]
        .parse::<f64>()
        .map_err(|_| malformed(format!("invalid latency '{}'", fields[9])))?;
    let shape = ProblemShape::new(m, n, k, indtype)?
        .with_outdtype(outdtype)
        .with_bias(bias)
        .with_scale_ab(scale_ab);
    Ok(TuningResult {
        shape,
        family,
        candidate_id: fields[8].to_string(),
        latency_ns,
    })
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "True" | "TRUE" | "1" => Some(true),
        "false" | "False" | "FALSE" | "0" | "" => Some(false),
        _ => None,
    }
}
