//! CSV tables and ordered integer indexes.
//!
//! Match values of the form `basename[col]` read `basename.csv`, parse every
//! field as an integer, and index the rows by the chosen column. The index is
//! ordered so that range comparators can pick the relevant endpoint, and it
//! keeps the row numbers so that call arguments can join back against the
//! table at emission time.
//!
//! Tables are memoised per basename; they outlive every match entry that
//! references them.

use crate::result::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::rc::Rc;

/// A parsed CSV table of integer cells.
#[derive(Debug)]
pub struct Table {
    /// Basename the table was requested under (no `.csv` suffix).
    pub basename: String,
    /// Path the table was read from.
    pub path: String,
    /// Row-major cells.
    pub rows: Vec<Vec<i64>>,
}

/// Memoising loader: each basename is read and parsed at most once.
#[derive(Default)]
pub struct CsvCache {
    tables: HashMap<String, Rc<Table>>,
}

impl CsvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `basename.csv`, reusing a previously parsed table when present.
    /// An explicit `.csv` suffix on the basename is accepted and stripped.
    pub fn load(&mut self, basename: &str) -> Result<Rc<Table>> {
        let basename = basename.strip_suffix(".csv").unwrap_or(basename);
        if let Some(table) = self.tables.get(basename) {
            return Ok(Rc::clone(table));
        }
        let path = format!("{basename}.csv");
        let text = fs::read_to_string(&path).map_err(|e| Error::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let rows = parse_rows(&path, &text)?;
        tracing::debug!("loaded CSV table '{}' ({} rows)", path, rows.len());
        let table = Rc::new(Table {
            basename: basename.to_string(),
            path,
            rows,
        });
        self.tables.insert(basename.to_string(), Rc::clone(&table));
        Ok(table)
    }
}

fn parse_rows(path: &str, text: &str) -> Result<Vec<Vec<i64>>> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for (colno, field) in split_fields(line).into_iter().enumerate() {
            let cell = field.trim();
            let cell = cell
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(cell);
            row.push(parse_int(cell).ok_or_else(|| Error::Csv {
                path: path.to_string(),
                row: lineno + 1,
                column: colno + 1,
                message: format!("expected an integer, found \"{cell}\""),
            })?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Splits one line on commas, honoring double-quoted fields.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn parse_int(s: &str) -> Option<i64> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if neg { -value } else { value })
}

/// An ordered integer index: key column value to row numbers.
///
/// Also used for plain `1,2,3` value lists, in which case there is no backing
/// table and the row lists are empty.
#[derive(Debug, Default)]
pub struct IntIndex {
    keys: BTreeMap<i64, Vec<usize>>,
    table: Option<Rc<Table>>,
}

impl IntIndex {
    /// Builds an index over a literal value list.
    pub fn from_values(values: impl IntoIterator<Item = i64>) -> Self {
        let mut keys = BTreeMap::new();
        for v in values {
            keys.entry(v).or_insert_with(Vec::new);
        }
        IntIndex { keys, table: None }
    }

    /// Builds an index over `col` of `table`.
    pub fn from_table(table: Rc<Table>, col: usize) -> Result<Self> {
        let mut keys: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (rowno, row) in table.rows.iter().enumerate() {
            let key = *row.get(col).ok_or_else(|| Error::Csv {
                path: table.path.clone(),
                row: rowno + 1,
                column: col + 1,
                message: format!("row has only {} column(s)", row.len()),
            })?;
            keys.entry(key).or_default().push(rowno);
        }
        Ok(IntIndex {
            keys,
            table: Some(table),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, value: i64) -> bool {
        self.keys.contains_key(&value)
    }

    /// Smallest key; range comparators `gt`/`geq` compare against this.
    pub fn min(&self) -> Option<i64> {
        self.keys.keys().next().copied()
    }

    /// Largest key; range comparators `lt`/`leq` compare against this.
    pub fn max(&self) -> Option<i64> {
        self.keys.keys().next_back().copied()
    }

    /// Joins an observed key back to the unique table row it selects, and
    /// returns the value in `col` of that row. Zero or several candidate rows
    /// is a fatal error.
    pub fn unique_row_value(&self, key: i64, col: usize) -> Result<i64> {
        let table = self.table.as_ref().ok_or_else(|| {
            Error::Internal("argument lookup against a value list, not a table".into())
        })?;
        let rows = self.keys.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        if rows.len() != 1 {
            return Err(Error::CsvLookup {
                basename: table.basename.clone(),
                key,
                count: rows.len(),
            });
        }
        let row = &table.rows[rows[0]];
        row.get(col).copied().ok_or_else(|| Error::Csv {
            path: table.path.clone(),
            row: rows[0] + 1,
            column: col + 1,
            message: format!("row has only {} column(s)", row.len()),
        })
    }
}
