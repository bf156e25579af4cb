//! In-memory tabular model shared by every stage.
//!
//! A `Table` is an ordered list of named columns and an ordered list of rows.
//! Row order is always the natural order of the source file, which is what
//! makes `first` reductions and first-wins deduplication reproducible.

use std::fmt;

use serde::Serialize;

/// One cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Parse a raw cell. `decimal_comma` accepts `4,5` as a float, used for
    /// files that are not comma separated.
    pub fn parse(raw: &str, decimal_comma: bool) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        if decimal_comma && raw.matches(',').count() == 1 && !raw.contains('.') {
            if let Ok(f) = raw.replace(',', ".").parse::<f64>() {
                if f.is_finite() {
                    return Value::Float(f);
                }
            }
        }
        Value::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer code, accepting floats with no fractional part (`4.0`).
    pub fn as_code(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Option<f64>> for Value {
    fn from(f: Option<f64>) -> Self {
        f.map(Value::Float).unwrap_or(Value::Null)
    }
}

/// Grouping and join key. Numeric codes compare numerically no matter how a
/// source spelled them (`3550308`, `3550308.0` and `"3550308"` are one key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Code(i64),
    Text(String),
}

impl Key {
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Null => None,
            Value::Text(s) => match s.trim().parse::<i64>() {
                Ok(code) => Some(Key::Code(code)),
                Err(_) => Some(Key::Text(s.clone())),
            },
            other => match other.as_code() {
                Some(code) => Some(Key::Code(code)),
                None => Some(Key::Text(other.to_string())),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Code(c) => Value::Int(*c),
            Key::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Code(c) => write!(f, "{}", c),
            Key::Text(s) => f.write_str(s),
        }
    }
}

/// Column-oriented schema, row-oriented data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build from string columns and rows; rows shorter than the header are
    /// padded with nulls.
    pub fn from_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, Value::Null);
                r
            })
            .collect();
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Cell by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Iterator over one column's cells, in row order.
    pub fn column_values<'a>(&'a self, column: &str) -> Option<impl Iterator<Item = &'a Value>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(move |r| &r[idx]))
    }

    /// Append a column; if it already exists its values are replaced.
    pub fn with_column(mut self, name: &str, values: Vec<Value>) -> Self {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column_index(name) {
            Some(idx) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        self
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        if self.has_column(to) {
            return false;
        }
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[String], &[Value]) -> bool,
    {
        let columns = &self.columns;
        self.rows.retain(|r| keep(columns, r));
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Vec<Value>> {
        &mut self.rows
    }

    /// Columns whose non-null cells are all numeric (and at least one exists).
    pub fn numeric_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let mut seen = false;
                for row in &self.rows {
                    match &row[*i] {
                        Value::Null => {}
                        v if v.is_numeric() => seen = true,
                        _ => return false,
                    }
                }
                seen
            })
            .map(|(_, c)| c.clone())
            .collect()
    }

}

// =============================================================================
// TESTS
// =============================================================================
