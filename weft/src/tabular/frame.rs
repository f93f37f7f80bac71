//! In-memory tabular frame: typed cells, column dtypes, and the operations
//! the restricted query language evaluates against.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde_json::Value as JsonValue;

use super::TabularError;

/// One cell. Integers and floats are kept apart so column dtypes mirror the
/// loaded data; mixed numeric columns report `float64`.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(i) => Some(*i as f64),
            Cell::Float(f) => Some(*f),
            Cell::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Cell::Null => JsonValue::Null,
            Cell::Bool(b) => JsonValue::Bool(*b),
            Cell::Int(i) => JsonValue::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(JsonValue::Null, JsonValue::Number),
            Cell::Str(s) => JsonValue::String(s.clone()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Cell::Null => "null".to_string(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => f.to_string(),
            Cell::Str(s) => s.clone(),
        }
    }

    fn from_json(value: &JsonValue) -> Cell {
        match value {
            JsonValue::Null => Cell::Null,
            JsonValue::Bool(b) => Cell::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Cell::Int(i)
                } else {
                    Cell::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Cell::Str(s.clone()),
            other => Cell::Str(other.to_string()),
        }
    }

    /// CSV / spreadsheet text → typed cell.
    pub fn infer(raw: &str) -> Cell {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Cell::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Cell::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Cell::Float(f);
        }
        match trimmed {
            "true" | "True" | "TRUE" => Cell::Bool(true),
            "false" | "False" | "FALSE" => Cell::Bool(false),
            _ => Cell::Str(trimmed.to_string()),
        }
    }
}

/// Column-ordered table with an implicit integer row index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// An extracted column plus the row labels it kept through filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub labels: Vec<String>,
    pub values: Vec<Cell>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Pandas-style dtype name for one column.
    pub fn dtype(&self, col: usize) -> &'static str {
        let mut saw_int = false;
        let mut saw_float = false;
        let mut saw_bool = false;
        let mut saw_str = false;
        for row in &self.rows {
            match row.get(col) {
                Some(Cell::Int(_)) => saw_int = true,
                Some(Cell::Float(_)) => saw_float = true,
                Some(Cell::Bool(_)) => saw_bool = true,
                Some(Cell::Str(_)) => saw_str = true,
                _ => {}
            }
        }
        if saw_str {
            "object"
        } else if saw_float {
            "float64"
        } else if saw_int {
            "int64"
        } else if saw_bool {
            "bool"
        } else {
            "object"
        }
    }

    pub fn dtypes(&self) -> Vec<(String, &'static str)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.dtype(i)))
            .collect()
    }

    pub fn column(&self, name: &str) -> Result<Series, TabularError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TabularError::UnknownColumn(name.to_string()))?;
        Ok(Series {
            name: name.to_string(),
            labels: (0..self.rows.len()).map(|i| i.to_string()).collect(),
            values: self
                .rows
                .iter()
                .map(|row| row.get(idx).cloned().unwrap_or(Cell::Null))
                .collect(),
        })
    }

    pub fn select_columns(&self, names: &[String]) -> Result<Frame, TabularError> {
        let indexes: Vec<usize> = names
            .iter()
            .map(|n| {
                self.column_index(n)
                    .ok_or_else(|| TabularError::UnknownColumn(n.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Frame::new(
            names.to_vec(),
            self.rows
                .iter()
                .map(|row| {
                    indexes
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(Cell::Null))
                        .collect()
                })
                .collect(),
        ))
    }

    pub fn filter_rows(&self, mask: &[bool]) -> Frame {
        Frame::new(
            self.columns.clone(),
            self.rows
                .iter()
                .zip(mask.iter().chain(std::iter::repeat(&false)))
                .filter(|(_, keep)| **keep)
                .map(|(row, _)| row.clone())
                .collect(),
        )
    }

    pub fn head(&self, n: usize) -> Frame {
        Frame::new(
            self.columns.clone(),
            self.rows.iter().take(n).cloned().collect(),
        )
    }

    pub fn tail(&self, n: usize) -> Frame {
        let skip = self.rows.len().saturating_sub(n);
        Frame::new(
            self.columns.clone(),
            self.rows.iter().skip(skip).cloned().collect(),
        )
    }

    pub fn slice(&self, start: usize, end: usize) -> Frame {
        Frame::new(
            self.columns.clone(),
            self.rows
                .iter()
                .skip(start)
                .take(end.saturating_sub(start))
                .cloned()
                .collect(),
        )
    }

    pub fn sort_by(&self, column: &str, ascending: bool) -> Result<Frame, TabularError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| TabularError::UnknownColumn(column.to_string()))?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| directional_compare(a.get(idx), b.get(idx), ascending));
        Ok(Frame::new(self.columns.clone(), rows))
    }

    pub fn dropna(&self) -> Frame {
        Frame::new(
            self.columns.clone(),
            self.rows
                .iter()
                .filter(|row| !row.iter().any(Cell::is_null))
                .cloned()
                .collect(),
        )
    }

    pub fn fillna(&self, value: &Cell) -> Frame {
        Frame::new(
            self.columns.clone(),
            self.rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| {
                            if cell.is_null() {
                                value.clone()
                            } else {
                                cell.clone()
                            }
                        })
                        .collect()
                })
                .collect(),
        )
    }

    /// Boolean frame marking nulls (or non-nulls when `negate`).
    pub fn null_mask_frame(&self, negate: bool) -> Frame {
        Frame::new(
            self.columns.clone(),
            self.rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| Cell::Bool(cell.is_null() != negate))
                        .collect()
                })
                .collect(),
        )
    }

    pub fn numeric_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&i| matches!(self.dtype(i), "int64" | "float64"))
            .collect()
    }

    pub fn select_numeric(&self) -> Frame {
        let names: Vec<String> = self
            .numeric_columns()
            .into_iter()
            .map(|i| self.columns[i].clone())
            .collect();
        self.select_columns(&names).unwrap_or_default()
    }

    fn column_f64(&self, col: usize) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|row| row.get(col).and_then(Cell::as_f64))
            .collect()
    }

    /// Per-column aggregate over numeric columns.
    pub fn aggregate_numeric(&self, op: &str) -> Result<Series, TabularError> {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        for col in self.numeric_columns() {
            let data = self.column_f64(col);
            if let Some(v) = aggregate(&data, op) {
                labels.push(self.columns[col].clone());
                values.push(float_cell(v));
            }
        }
        Ok(Series {
            name: op.to_string(),
            labels,
            values,
        })
    }

    /// Non-null count per column (every column, like `df.count()`).
    pub fn count_series(&self) -> Series {
        Series {
            name: "count".into(),
            labels: self.columns.clone(),
            values: self
                .columns
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    Cell::Int(
                        self.rows
                            .iter()
                            .filter(|row| row.get(i).is_some_and(|c| !c.is_null()))
                            .count() as i64,
                    )
                })
                .collect(),
        }
    }

    pub fn nunique_series(&self) -> Series {
        Series {
            name: "nunique".into(),
            labels: self.columns.clone(),
            values: self
                .columns
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let mut seen: Vec<String> = self
                        .rows
                        .iter()
                        .filter_map(|row| row.get(i))
                        .filter(|c| !c.is_null())
                        .map(Cell::render)
                        .collect();
                    seen.sort();
                    seen.dedup();
                    Cell::Int(seen.len() as i64)
                })
                .collect(),
        }
    }

    /// `count / mean / std / min / max` per numeric column.
    pub fn describe(&self) -> Frame {
        let stats = ["count", "mean", "std", "min", "max"];
        let numeric = self.numeric_columns();
        let mut columns = vec!["statistic".to_string()];
        columns.extend(numeric.iter().map(|&i| self.columns[i].clone()));

        let rows = stats
            .iter()
            .map(|stat| {
                let mut row = vec![Cell::Str((*stat).to_string())];
                for &col in &numeric {
                    let data = self.column_f64(col);
                    let value = match *stat {
                        "count" => Some(data.len() as f64),
                        other => aggregate(&data, other),
                    };
                    row.push(value.map_or(Cell::Null, float_cell));
                }
                row
            })
            .collect();
        Frame::new(columns, rows)
    }

    /// Group rows by one column and aggregate every numeric column.
    pub fn groupby_aggregate(&self, by: &str, op: &str) -> Result<Frame, TabularError> {
        let key_idx = self
            .column_index(by)
            .ok_or_else(|| TabularError::UnknownColumn(by.to_string()))?;
        let numeric: Vec<usize> = self
            .numeric_columns()
            .into_iter()
            .filter(|&i| i != key_idx)
            .collect();

        let mut groups: BTreeMap<String, Vec<&Vec<Cell>>> = BTreeMap::new();
        for row in &self.rows {
            let key = row.get(key_idx).map(Cell::render).unwrap_or_default();
            groups.entry(key).or_default().push(row);
        }

        let mut columns = vec![by.to_string()];
        columns.extend(numeric.iter().map(|&i| self.columns[i].clone()));
        let rows = groups
            .into_iter()
            .map(|(key, members)| {
                let mut row = vec![Cell::Str(key)];
                for &col in &numeric {
                    let data: Vec<f64> = members
                        .iter()
                        .filter_map(|r| r.get(col).and_then(Cell::as_f64))
                        .collect();
                    let value = if op == "count" {
                        Some(members.len() as f64)
                    } else {
                        aggregate(&data, op)
                    };
                    row.push(value.map_or(Cell::Null, float_cell));
                }
                row
            })
            .collect();
        Ok(Frame::new(columns, rows))
    }

    pub fn sample(&self, n: usize) -> Frame {
        use rand::seq::SliceRandom;
        let mut rows = self.rows.clone();
        rows.shuffle(&mut rand::thread_rng());
        rows.truncate(n);
        Frame::new(self.columns.clone(), rows)
    }

    /// Row-wise concatenation over the union of columns; absent cells are
    /// null. Used when an agent has several loaded files.
    pub fn concat(frames: &[&Frame]) -> Frame {
        let mut columns: Vec<String> = Vec::new();
        for frame in frames {
            for col in &frame.columns {
                if !columns.contains(col) {
                    columns.push(col.clone());
                }
            }
        }
        let mut rows = Vec::new();
        for frame in frames {
            for row in &frame.rows {
                rows.push(
                    columns
                        .iter()
                        .map(|col| {
                            frame
                                .column_index(col)
                                .and_then(|i| row.get(i).cloned())
                                .unwrap_or(Cell::Null)
                        })
                        .collect(),
                );
            }
        }
        Frame::new(columns, rows)
    }

    pub fn to_records(&self) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|row| {
                JsonValue::Object(
                    self.columns
                        .iter()
                        .zip(row.iter())
                        .map(|(col, cell)| (col.clone(), cell.to_json()))
                        .collect(),
                )
            })
            .collect()
    }

    // ---- loaders ----------------------------------------------------------

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Frame, TabularError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let columns: Vec<String> = csv_reader
            .headers()
            .map_err(|e| TabularError::Load(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| TabularError::Load(e.to_string()))?;
            let mut row: Vec<Cell> = record.iter().map(Cell::infer).collect();
            row.resize(columns.len(), Cell::Null);
            rows.push(row);
        }
        Ok(Frame::new(columns, rows))
    }

    /// JSON array of objects, single object, or a bare scalar-record.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Frame, TabularError> {
        let value: JsonValue =
            serde_json::from_slice(bytes).map_err(|e| TabularError::Load(e.to_string()))?;
        let records: Vec<JsonValue> = match value {
            JsonValue::Array(items) => items,
            JsonValue::Object(_) => vec![value],
            scalar => vec![serde_json::json!({ "value": scalar })],
        };

        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            if let Some(map) = record.as_object() {
                for key in map.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|col| {
                        record
                            .as_object()
                            .and_then(|map| map.get(col))
                            .map_or(Cell::Null, Cell::from_json)
                    })
                    .collect()
            })
            .collect();
        Ok(Frame::new(columns, rows))
    }

    pub fn from_xlsx_path(path: &Path) -> Result<Frame, TabularError> {
        use calamine::{Data, Reader};
        let mut workbook = calamine::open_workbook_auto(path)
            .map_err(|e| TabularError::Load(e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| TabularError::Load("workbook has no sheets".into()))?
            .map_err(|e| TabularError::Load(e.to_string()))?;

        let mut rows_iter = range.rows();
        let columns: Vec<String> = rows_iter
            .next()
            .map(|header| header.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default();
        let rows = rows_iter
            .map(|row| {
                let mut cells: Vec<Cell> = row
                    .iter()
                    .map(|cell| match cell {
                        Data::Empty => Cell::Null,
                        Data::Bool(b) => Cell::Bool(*b),
                        Data::Int(i) => Cell::Int(*i),
                        Data::Float(f) => {
                            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                                Cell::Int(*f as i64)
                            } else {
                                Cell::Float(*f)
                            }
                        }
                        other => Cell::infer(&other.to_string()),
                    })
                    .collect();
                cells.resize(columns.len(), Cell::Null);
                cells
            })
            .collect();
        Ok(Frame::new(columns, rows))
    }
}

/// Sort comparator that keeps nulls last in either direction.
pub fn directional_compare(
    a: Option<&Cell>,
    b: Option<&Cell>,
    ascending: bool,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let a_null = matches!(a, None | Some(Cell::Null));
    let b_null = matches!(b, None | Some(Cell::Null));
    match (a_null, b_null) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = compare_cells(a, b);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        }
    }
}

/// Total order for sorting: nulls last, numbers before strings.
pub fn compare_cells(a: Option<&Cell>, b: Option<&Cell>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None | Some(Cell::Null), None | Some(Cell::Null)) => Ordering::Equal,
        (None | Some(Cell::Null), _) => Ordering::Greater,
        (_, None | Some(Cell::Null)) => Ordering::Less,
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.total_cmp(&fy),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => x.render().cmp(&y.render()),
        },
    }
}

fn aggregate(data: &[f64], op: &str) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    match op {
        "sum" => Some(data.iter().sum()),
        "mean" => Some(data.iter().sum::<f64>() / data.len() as f64),
        "median" => {
            let mut sorted = data.to_vec();
            sorted.sort_by(f64::total_cmp);
            let mid = sorted.len() / 2;
            Some(if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            })
        }
        "min" => data.iter().copied().reduce(f64::min),
        "max" => data.iter().copied().reduce(f64::max),
        "std" => {
            if data.len() < 2 {
                return Some(0.0);
            }
            let mean = data.iter().sum::<f64>() / data.len() as f64;
            let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / (data.len() - 1) as f64;
            Some(var.sqrt())
        }
        _ => None,
    }
}

/// Keeps integral aggregates as ints so `sum()` on an int column stays int.
fn float_cell(v: f64) -> Cell {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Cell::Int(v as i64)
    } else {
        Cell::Float(v)
    }
}
