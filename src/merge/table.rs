//! In-memory feature tables parsed from worker output files.
//!
//! Workers upload one table per segmented object class, as CSV or
//! Parquet. Both land in the same row-oriented [`FeatureTable`]
//! representation so the merge logic never cares about the wire format.

use std::fmt;

use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use arrow::array::{Array, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::DataType;

use crate::error::{PlateflowError, Result};

/// One cell of a feature table.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl CellValue {
    /// Parse a CSV field: empty means null, numerics stay numeric.
    fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::Null;
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Self::Float(f);
        }
        match raw {
            "true" | "True" => Self::Bool(true),
            "false" | "False" => Self::Bool(false),
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A named table of feature measurements, row-oriented.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl FeatureTable {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Decode a result file by extension. Anything that is not CSV or
    /// Parquet fails the merge.
    pub fn from_bytes(name: &str, extension: Option<&str>, bytes: Vec<u8>) -> Result<Self> {
        match extension {
            Some("csv") => Self::from_csv(name, &bytes),
            Some("parquet") => Self::from_parquet(name, bytes),
            other => Err(PlateflowError::Merge(format!(
                "result file {name:?} has unsupported extension {other:?}"
            ))),
        }
    }

    pub fn from_csv(name: &str, bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| {
            PlateflowError::Merge(format!("table {name:?} is not valid UTF-8"))
        })?;
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| PlateflowError::Merge(format!("table {name:?} is empty")))?;

        let columns = split_csv_line(header);
        let mut table = Self::new(name, columns);
        for line in lines {
            let fields = split_csv_line(line);
            if fields.len() != table.columns.len() {
                return Err(PlateflowError::Merge(format!(
                    "table {name:?} row has {} fields, expected {}",
                    fields.len(),
                    table.columns.len()
                )));
            }
            table
                .rows
                .push(fields.iter().map(|f| CellValue::parse(f)).collect());
        }
        Ok(table)
    }

    pub fn from_parquet(name: &str, bytes: Vec<u8>) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
            .map_err(|e| PlateflowError::Merge(format!("table {name:?}: {e}")))?;
        let reader = builder
            .build()
            .map_err(|e| PlateflowError::Merge(format!("table {name:?}: {e}")))?;

        let mut table: Option<Self> = None;
        for batch in reader {
            let batch =
                batch.map_err(|e| PlateflowError::Merge(format!("table {name:?}: {e}")))?;
            let table = table.get_or_insert_with(|| {
                Self::new(
                    name,
                    batch
                        .schema()
                        .fields()
                        .iter()
                        .map(|f| f.name().clone())
                        .collect(),
                )
            });

            let mut rows: Vec<Vec<CellValue>> =
                (0..batch.num_rows()).map(|_| Vec::new()).collect();
            for column in batch.columns() {
                append_column_values(name, column.as_ref(), &mut rows)?;
            }
            table.rows.extend(rows);
        }

        table.ok_or_else(|| PlateflowError::Merge(format!("table {name:?} is empty")))
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn value(&self, row: usize, column: usize) -> &CellValue {
        &self.rows[row][column]
    }

    /// Append another table's rows, aligning columns by name. Columns
    /// missing on either side are backfilled with nulls.
    pub fn append(&mut self, other: FeatureTable) {
        let mapping: Vec<usize> = other
            .columns
            .iter()
            .map(|column| match self.column_index(column) {
                Some(idx) => idx,
                None => {
                    self.columns.push(column.clone());
                    for row in &mut self.rows {
                        row.push(CellValue::Null);
                    }
                    self.columns.len() - 1
                }
            })
            .collect();

        for other_row in other.rows {
            let mut row = vec![CellValue::Null; self.columns.len()];
            for (value, &target) in other_row.into_iter().zip(&mapping) {
                row[target] = value;
            }
            self.rows.push(row);
        }
    }

    /// Serialize as CSV with a header row.
    pub fn to_csv(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(
            &self
                .columns
                .iter()
                .map(|c| escape_csv_field(c))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
        for row in &self.rows {
            out.push_str(
                &row.iter()
                    .map(|v| escape_csv_field(&v.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            out.push('\n');
        }
        out.into_bytes()
    }
}

fn append_column_values(
    table: &str,
    column: &dyn Array,
    rows: &mut [Vec<CellValue>],
) -> Result<()> {
    macro_rules! push_values {
        ($array_type:ty, $variant:expr) => {{
            let array = column
                .as_any()
                .downcast_ref::<$array_type>()
                .ok_or_else(|| {
                    PlateflowError::Merge(format!("table {table:?}: column downcast failed"))
                })?;
            for (i, row) in rows.iter_mut().enumerate() {
                row.push(if array.is_null(i) {
                    CellValue::Null
                } else {
                    $variant(array.value(i))
                });
            }
        }};
    }

    match column.data_type() {
        DataType::Int64 => push_values!(Int64Array, CellValue::Int),
        DataType::Int32 => push_values!(Int32Array, |v: i32| CellValue::Int(i64::from(v))),
        DataType::Float64 => push_values!(Float64Array, CellValue::Float),
        DataType::Float32 => push_values!(Float32Array, |v: f32| CellValue::Float(f64::from(v))),
        DataType::Boolean => push_values!(BooleanArray, CellValue::Bool),
        DataType::Utf8 => {
            push_values!(StringArray, |v: &str| CellValue::Text(v.to_string()))
        }
        other => {
            return Err(PlateflowError::Merge(format!(
                "table {table:?}: unsupported column type {other}"
            )))
        }
    }
    Ok(())
}

/// Minimal CSV field splitter with double-quote handling.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn escape_csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use arrow::array::{Float64Array as F64, Int64Array as I64, StringArray as Str};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    #[test]
    fn csv_parses_typed_cells() {
        let table = FeatureTable::from_csv(
            "nucleus",
            b"well,site,ObjectNumber,Area,Label\nB03,1,1,40.5,big\nB03,1,2,,small\n",
        )
        .unwrap();
        assert_eq!(table.columns.len(), 5);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.value(0, 2), &CellValue::Int(1));
        assert_eq!(table.value(0, 3), &CellValue::Float(40.5));
        assert_eq!(table.value(1, 3), &CellValue::Null);
        assert_eq!(table.value(1, 4).as_str(), Some("small"));
    }

    #[test]
    fn csv_with_quoted_comma_survives() {
        let table =
            FeatureTable::from_csv("t", b"name,count\n\"a,b\",2\n").unwrap();
        assert_eq!(table.value(0, 0).as_str(), Some("a,b"));
        // and writes back escaped
        let csv = String::from_utf8(table.to_csv()).unwrap();
        assert!(csv.contains("\"a,b\""));
    }

    #[test]
    fn ragged_csv_is_rejected() {
        assert!(FeatureTable::from_csv("t", b"a,b\n1\n").is_err());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err =
            FeatureTable::from_bytes("nucleus", Some("xlsx"), vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, PlateflowError::Merge(_)));
    }

    #[test]
    fn parquet_round_trips_through_arrow() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("well", DataType::Utf8, false),
            Field::new("site", DataType::Int64, false),
            Field::new("Area", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Str::from(vec!["B03", "B03"])),
                Arc::new(I64::from(vec![1, 2])),
                Arc::new(F64::from(vec![Some(40.5), None])),
            ],
        )
        .unwrap();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let table = FeatureTable::from_parquet("nucleus", buf).unwrap();
        assert_eq!(table.columns, vec!["well", "site", "Area"]);
        assert_eq!(table.value(0, 0).as_str(), Some("B03"));
        assert_eq!(table.value(1, 1), &CellValue::Int(2));
        assert!(table.value(1, 2).is_null());
    }

    #[test]
    fn append_aligns_columns_by_name() {
        let mut a = FeatureTable::from_csv("t", b"well,Area\nB03,1.5\n").unwrap();
        let b = FeatureTable::from_csv("t", b"Area,well,Extra\n2.5,C07,9\n").unwrap();
        a.append(b);
        assert_eq!(a.columns, vec!["well", "Area", "Extra"]);
        assert_eq!(a.rows.len(), 2);
        assert!(a.value(0, 2).is_null());
        assert_eq!(a.value(1, 0).as_str(), Some("C07"));
        assert_eq!(a.value(1, 1), &CellValue::Float(2.5));
    }
}
