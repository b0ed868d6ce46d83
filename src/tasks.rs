//! Tasks-file parsing.
//!
//! A tasks file is a TSV whose header row declares a sequence of parameter
//! kinds and names (`--env SAMPLE<TAB>--input IN<TAB>--output OUT`) and
//! whose data rows supply the values, one task per row. An empty cell means
//! the parameter is absent for that task; `0` is a value, not an absence.

use std::path::Path;

use crate::param::{ParamError, ParamKind, TaskParams};

#[derive(Debug, thiserror::Error)]
pub enum TasksFileError {
    #[error("failed to read tasks file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("tasks file is empty")]
    Empty,

    #[error("tasks file has a header but no task rows")]
    NoRows,

    #[error("invalid tasks file header column '{0}'")]
    BadHeader(String),

    #[error("row {line}: expected {expected} columns, found {found}")]
    RowWidth {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("invalid task range '{0}': expected m, m-, or m-n (1-based)")]
    BadRange(String),

    #[error("task range '{0}' selects no rows ({1} task rows in file)")]
    RangeOutOfBounds(String, usize),

    #[error(transparent)]
    Param(#[from] ParamError),
}

/// A 1-based inclusive selection of task rows: `m`, `m-`, or `m-n`.
///
/// A missing lower bound is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl TaskRange {
    pub fn parse(s: &str) -> Result<Self, TasksFileError> {
        let bad = || TasksFileError::BadRange(s.to_string());
        match s.split_once('-') {
            None => {
                let n: u32 = s.parse().map_err(|_| bad())?;
                if n == 0 {
                    return Err(bad());
                }
                Ok(Self {
                    start: n,
                    end: Some(n),
                })
            }
            Some((lo, hi)) => {
                let start: u32 = lo.parse().map_err(|_| bad())?;
                if start == 0 {
                    return Err(bad());
                }
                let end = if hi.is_empty() {
                    None
                } else {
                    let n: u32 = hi.parse().map_err(|_| bad())?;
                    if n < start {
                        return Err(bad());
                    }
                    Some(n)
                };
                Ok(Self { start, end })
            }
        }
    }

    fn contains(&self, row: u32) -> bool {
        row >= self.start && self.end.is_none_or(|e| row <= e)
    }
}

/// One declared column of the tasks file.
#[derive(Debug, Clone)]
struct Column {
    kind: ParamKind,
    name: Option<String>,
}

/// A parsed tasks file: typed header plus raw data rows.
#[derive(Debug, Clone)]
pub struct TasksFile {
    columns: Vec<Column>,
    rows: Vec<Vec<String>>,
}

impl TasksFile {
    pub fn from_path(path: &Path) -> Result<Self, TasksFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| TasksFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parses the TSV content. Trailing newlines are tolerated; blank
    /// interior lines are not task rows.
    pub fn parse(content: &str) -> Result<Self, TasksFileError> {
        let mut lines = content.lines();
        let header = lines.next().ok_or(TasksFileError::Empty)?;
        if header.trim().is_empty() {
            return Err(TasksFileError::Empty);
        }

        let columns = header
            .split('\t')
            .map(parse_header_cell)
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let cells: Vec<String> = line.split('\t').map(|c| c.to_string()).collect();
            rows.push(cells);
        }
        if rows.is_empty() {
            return Err(TasksFileError::NoRows);
        }

        for (idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TasksFileError::RowWidth {
                    // 1-based file line: header is line 1.
                    line: idx + 2,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
        }

        Ok(Self { columns, rows })
    }

    /// Number of data rows in the file.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Materializes the selected rows into per-task parameter sets.
    ///
    /// Returns `(task_number, params)` pairs where the task number is the
    /// 1-based row ordinal in the file, so a range of `3-5` yields tasks
    /// numbered 3, 4, and 5.
    pub fn task_rows(
        &self,
        range: Option<TaskRange>,
        range_text: &str,
    ) -> Result<Vec<(u32, TaskParams)>, TasksFileError> {
        let mut selected = Vec::new();
        for (idx, row) in self.rows.iter().enumerate() {
            let task_num = (idx + 1) as u32;
            if let Some(r) = range
                && !r.contains(task_num)
            {
                continue;
            }
            let mut params = TaskParams::new();
            for (col, cell) in self.columns.iter().zip(row.iter()) {
                // An empty cell means the parameter is absent for this task.
                if cell.is_empty() {
                    continue;
                }
                match col.kind {
                    ParamKind::Env => params.add_env(required_name(col)?, cell)?,
                    ParamKind::Input => params.add_input(col.name.as_deref(), cell, false)?,
                    ParamKind::InputRecursive => {
                        params.add_input(col.name.as_deref(), cell, true)?
                    }
                    ParamKind::Output => params.add_output(col.name.as_deref(), cell, false)?,
                    ParamKind::OutputRecursive => {
                        params.add_output(col.name.as_deref(), cell, true)?
                    }
                    ParamKind::Mount => params.add_mount(required_name(col)?, cell)?,
                    ParamKind::Label => params.add_label(required_name(col)?, cell)?,
                }
            }
            selected.push((task_num, params));
        }
        if selected.is_empty() {
            return Err(TasksFileError::RangeOutOfBounds(
                range_text.to_string(),
                self.rows.len(),
            ));
        }
        Ok(selected)
    }
}

fn required_name(col: &Column) -> Result<&str, TasksFileError> {
    col.name
        .as_deref()
        .ok_or_else(|| TasksFileError::BadHeader(format!("{:?} column requires a name", col.kind)))
}

/// Parses one header cell, e.g. `--env SAMPLE` or `--input`.
fn parse_header_cell(cell: &str) -> Result<Column, TasksFileError> {
    let mut parts = cell.split_whitespace();
    let flag = parts
        .next()
        .ok_or_else(|| TasksFileError::BadHeader(cell.to_string()))?;
    let kind = ParamKind::from_flag(flag).ok_or_else(|| TasksFileError::BadHeader(cell.to_string()))?;
    let name = parts.next().map(|s| s.to_string());
    if parts.next().is_some() {
        return Err(TasksFileError::BadHeader(cell.to_string()));
    }
    Ok(Column { kind, name })
}
