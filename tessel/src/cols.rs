//! In-memory columnar batches.
//!
//! A [`DataCols`] holds rows for one table, sorted ascending by the
//! timestamp in column 0. Each column is a fixed-width little-endian byte
//! buffer plus one null flag per row, which is exactly what the block codec
//! writes to disk. Buffers are reused across [`DataCols::reset`] calls so the
//! helper's two scratch batches do not reallocate per table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConsistencyError, Result, TesselError};

/// Fixed-width column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Signed 64-bit timestamp. Column 0 of every schema.
    Timestamp,
    /// One-byte boolean.
    Bool,
    /// Signed 8-bit integer.
    TinyInt,
    /// Signed 16-bit integer.
    SmallInt,
    /// Signed 32-bit integer.
    Int,
    /// Signed 64-bit integer.
    BigInt,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
}

impl ColumnType {
    /// Bytes per value.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::Bool | Self::TinyInt => 1,
            Self::SmallInt => 2,
            Self::Int | Self::Float => 4,
            Self::Timestamp | Self::BigInt | Self::Double => 8,
        }
    }

    /// On-disk type tag.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Timestamp => 1,
            Self::Bool => 2,
            Self::TinyInt => 3,
            Self::SmallInt => 4,
            Self::Int => 5,
            Self::BigInt => 6,
            Self::Float => 7,
            Self::Double => 8,
        }
    }

    /// Parses an on-disk type tag.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Timestamp,
            2 => Self::Bool,
            3 => Self::TinyInt,
            4 => Self::SmallInt,
            5 => Self::Int,
            6 => Self::BigInt,
            7 => Self::Float,
            8 => Self::Double,
            _ => return None,
        })
    }
}

/// A single cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Missing value.
    Null,
    /// Timestamp.
    Timestamp(i64),
    /// Boolean.
    Bool(bool),
    /// 8-bit integer.
    TinyInt(i8),
    /// 16-bit integer.
    SmallInt(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
}

impl Value {
    /// The column type this value fits, or `None` for [`Value::Null`].
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        Some(match self {
            Self::Null => return None,
            Self::Timestamp(_) => ColumnType::Timestamp,
            Self::Bool(_) => ColumnType::Bool,
            Self::TinyInt(_) => ColumnType::TinyInt,
            Self::SmallInt(_) => ColumnType::SmallInt,
            Self::Int(_) => ColumnType::Int,
            Self::BigInt(_) => ColumnType::BigInt,
            Self::Float(_) => ColumnType::Float,
            Self::Double(_) => ColumnType::Double,
        })
    }

    /// Numeric view used by aggregations. Booleans count as 0 or 1.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // summaries tolerate rounding above 2^53
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Null => None,
            Self::Timestamp(v) | Self::BigInt(v) => Some(v as f64),
            Self::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            Self::TinyInt(v) => Some(f64::from(v)),
            Self::SmallInt(v) => Some(f64::from(v)),
            Self::Int(v) => Some(f64::from(v)),
            Self::Float(v) => Some(f64::from(v)),
            Self::Double(v) => Some(v),
        }
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        match *self {
            Self::Null => {}
            Self::Timestamp(v) | Self::BigInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Bool(v) => out.push(u8::from(v)),
            Self::TinyInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::SmallInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn read_le(ty: ColumnType, bytes: &[u8]) -> Self {
        let mut b8 = [0u8; 8];
        b8[..bytes.len()].copy_from_slice(bytes);
        match ty {
            ColumnType::Timestamp => Self::Timestamp(i64::from_le_bytes(b8)),
            ColumnType::BigInt => Self::BigInt(i64::from_le_bytes(b8)),
            ColumnType::Bool => Self::Bool(b8[0] != 0),
            ColumnType::TinyInt => Self::TinyInt(i8::from_le_bytes([b8[0]])),
            ColumnType::SmallInt => Self::SmallInt(i16::from_le_bytes([b8[0], b8[1]])),
            ColumnType::Int => Self::Int(i32::from_le_bytes([b8[0], b8[1], b8[2], b8[3]])),
            ColumnType::Float => Self::Float(f32::from_le_bytes([b8[0], b8[1], b8[2], b8[3]])),
            ColumnType::Double => Self::Double(f64::from_le_bytes(b8)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Timestamp(v) | Self::BigInt(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::TinyInt(v) => write!(f, "{v}"),
            Self::SmallInt(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
        }
    }
}

/// Column id and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column id, unique within a schema.
    pub id: i16,
    /// Value type.
    pub ty: ColumnType,
}

/// A versioned table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version recorded on every block.
    pub version: i32,
    /// Columns in storage order; column 0 is the timestamp key.
    pub columns: Vec<ColumnSpec>,
}

impl Schema {
    /// Builds and validates a schema.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSchema`] if the column list is empty,
    /// column 0 is not a timestamp, or ids repeat.
    pub fn new(version: i32, columns: Vec<ColumnSpec>) -> Result<Self> {
        let schema = Self { version, columns };
        schema.validate()?;
        Ok(schema)
    }

    /// Checks the key column and id uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSchema`] on the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> TesselError { ConfigError::InvalidSchema { reason }.into() };
        let Some(first) = self.columns.first() else {
            return Err(invalid("schema has no columns".to_string()));
        };
        if first.ty != ColumnType::Timestamp {
            return Err(invalid(format!(
                "column 0 must be a timestamp, found {:?}",
                first.ty
            )));
        }
        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.id == col.id) {
                return Err(invalid(format!("duplicate column id {}", col.id)));
            }
        }
        Ok(())
    }

    /// Position of a column id.
    #[must_use]
    pub fn position(&self, id: i16) -> Option<usize> {
        self.columns.iter().position(|c| c.id == id)
    }
}

/// One column of a batch.
#[derive(Debug, Clone)]
pub struct ColumnData {
    spec: ColumnSpec,
    data: Vec<u8>,
    nulls: Vec<bool>,
}

impl ColumnData {
    fn new(spec: ColumnSpec) -> Self {
        Self {
            spec,
            data: Vec::new(),
            nulls: Vec::new(),
        }
    }

    /// Rebuilds a column from decoded bytes.
    pub(crate) fn from_parts(spec: ColumnSpec, data: Vec<u8>, nulls: Vec<bool>) -> Self {
        Self { spec, data, nulls }
    }

    /// An all-null column of `rows` rows.
    pub(crate) fn null_filled(spec: ColumnSpec, rows: usize) -> Result<Self> {
        let mut col = Self::new(spec);
        col.reserve(rows)?;
        col.data.resize(rows * spec.ty.width(), 0);
        col.nulls.resize(rows, true);
        Ok(col)
    }

    /// Column id and type.
    #[must_use]
    pub fn spec(&self) -> ColumnSpec {
        self.spec
    }

    /// Raw little-endian values; null rows hold zero bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Per-row null flags.
    #[must_use]
    pub fn nulls(&self) -> &[bool] {
        &self.nulls
    }

    /// True if at least one row is null.
    #[must_use]
    pub fn has_nulls(&self) -> bool {
        self.nulls.iter().any(|n| *n)
    }

    fn value(&self, row: usize) -> Value {
        if self.nulls[row] {
            return Value::Null;
        }
        let w = self.spec.ty.width();
        Value::read_le(self.spec.ty, &self.data[row * w..(row + 1) * w])
    }

    fn reserve(&mut self, rows: usize) -> Result<()> {
        let bytes = rows * self.spec.ty.width();
        self.data
            .try_reserve(bytes)
            .map_err(|_| TesselError::oom("column buffer", bytes))?;
        self.nulls
            .try_reserve(rows)
            .map_err(|_| TesselError::oom("null flags", rows))?;
        Ok(())
    }

    fn push_from(&mut self, src: &Self, row: usize) {
        let w = self.spec.ty.width();
        self.data.extend_from_slice(&src.data[row * w..(row + 1) * w]);
        self.nulls.push(src.nulls[row]);
    }

    fn clear(&mut self) {
        self.data.clear();
        self.nulls.clear();
    }
}

/// Counts reported by [`DataCols::merge_sorted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeCounts {
    /// Rows taken from the existing batch.
    pub existing: usize,
    /// Incoming rows that were added.
    pub added: usize,
    /// Incoming rows dropped because their key was already present.
    pub duplicates: usize,
}

/// A sorted columnar batch for one table.
#[derive(Debug, Clone)]
pub struct DataCols {
    sversion: i32,
    cols: Vec<ColumnData>,
    rows: usize,
}

impl DataCols {
    /// Empty batch for `schema` with room for `capacity` rows.
    ///
    /// # Errors
    ///
    /// Returns [`TesselError::OutOfMemory`] if the buffers cannot be reserved.
    pub fn new(schema: &Schema, capacity: usize) -> Result<Self> {
        let mut cols = Vec::new();
        cols.try_reserve(schema.columns.len())
            .map_err(|_| TesselError::oom("column list", schema.columns.len()))?;
        for spec in &schema.columns {
            let mut col = ColumnData::new(*spec);
            col.reserve(capacity)?;
            cols.push(col);
        }
        Ok(Self {
            sversion: schema.version,
            cols,
            rows: 0,
        })
    }

    pub(crate) fn from_columns(sversion: i32, cols: Vec<ColumnData>, rows: usize) -> Self {
        Self {
            sversion,
            cols,
            rows,
        }
    }

    /// Clears all rows and re-targets the batch at `schema`, keeping the
    /// allocations of columns whose id and type are unchanged.
    pub fn reset(&mut self, schema: &Schema) {
        let mut old = std::mem::take(&mut self.cols);
        self.cols = schema
            .columns
            .iter()
            .map(|spec| {
                match old.iter().position(|c| c.spec == *spec) {
                    Some(pos) => {
                        let mut col = old.swap_remove(pos);
                        col.clear();
                        col
                    }
                    None => ColumnData::new(*spec),
                }
            })
            .collect();
        self.sversion = schema.version;
        self.rows = 0;
    }

    /// Clears all rows, keeping the layout.
    pub fn clear(&mut self) {
        for col in &mut self.cols {
            col.clear();
        }
        self.rows = 0;
    }

    /// Appends one row. Missing trailing values are stored as null.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::InvalidBatch`] if there are more values
    /// than columns, the key is null, or a value does not match its column
    /// type. Keys are not checked for order here; see [`Self::check_sorted`].
    pub fn push_row(&mut self, values: &[Value]) -> Result<()> {
        if values.len() > self.cols.len() {
            return Err(ConsistencyError::InvalidBatch {
                reason: format!(
                    "row has {} values but schema has {} columns",
                    values.len(),
                    self.cols.len()
                ),
            }
            .into());
        }
        if matches!(values.first(), None | Some(Value::Null)) {
            return Err(ConsistencyError::InvalidBatch {
                reason: "timestamp key must not be null".to_string(),
            }
            .into());
        }
        for (col, value) in self.cols.iter().zip(values) {
            if let Some(ty) = value.column_type()
                && ty != col.spec.ty
            {
                return Err(ConsistencyError::InvalidBatch {
                    reason: format!(
                        "column {} expects {:?}, got {:?}",
                        col.spec.id, col.spec.ty, ty
                    ),
                }
                .into());
            }
        }

        for (i, col) in self.cols.iter_mut().enumerate() {
            col.reserve(1)?;
            match values.get(i).copied().unwrap_or(Value::Null) {
                Value::Null => {
                    col.data.resize(col.data.len() + col.spec.ty.width(), 0);
                    col.nulls.push(true);
                }
                v => {
                    v.write_le(&mut col.data);
                    col.nulls.push(false);
                }
            }
        }
        self.rows += 1;
        Ok(())
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// True if the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Schema version the rows were written with.
    #[must_use]
    pub fn sversion(&self) -> i32 {
        self.sversion
    }

    /// All columns in storage order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnData] {
        &self.cols
    }

    /// Number of columns.
    #[must_use]
    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    /// Key of `row`.
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.num_rows()`.
    #[must_use]
    pub fn key_at(&self, row: usize) -> i64 {
        let b = &self.cols[0].data[row * 8..row * 8 + 8];
        i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    /// First key, if any.
    #[must_use]
    pub fn key_first(&self) -> Option<i64> {
        (self.rows > 0).then(|| self.key_at(0))
    }

    /// Last key, if any.
    #[must_use]
    pub fn key_last(&self) -> Option<i64> {
        (self.rows > 0).then(|| self.key_at(self.rows - 1))
    }

    /// Cell at (`col`, `row`).
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    #[must_use]
    pub fn value_at(&self, col: usize, row: usize) -> Value {
        self.cols[col].value(row)
    }

    /// All cells of `row`.
    #[must_use]
    pub fn row(&self, row: usize) -> Vec<Value> {
        self.cols.iter().map(|c| c.value(row)).collect()
    }

    /// True if every row of column `col` is null (or the batch is empty).
    #[must_use]
    pub fn is_all_null(&self, col: usize) -> bool {
        self.cols[col].nulls.iter().all(|n| *n)
    }

    /// Number of leading rows with key `<= bound`.
    #[must_use]
    pub fn rows_le(&self, bound: i64) -> usize {
        let (mut lo, mut hi) = (0, self.rows);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) <= bound {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the row whose key equals `key`.
    #[must_use]
    pub fn find_key(&self, key: i64) -> Option<usize> {
        let pos = self.rows_le(key);
        (pos > 0 && self.key_at(pos - 1) == key).then(|| pos - 1)
    }

    /// Verifies keys are strictly ascending.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::UnsortedBatch`] naming the first bad row.
    pub fn check_sorted(&self) -> Result<()> {
        for row in 1..self.rows {
            if self.key_at(row) <= self.key_at(row - 1) {
                return Err(ConsistencyError::UnsortedBatch { row }.into());
            }
        }
        Ok(())
    }

    fn check_layout(&self, other: &Self) -> Result<()> {
        let same = self.cols.len() == other.cols.len()
            && self.cols.iter().zip(&other.cols).all(|(a, b)| a.spec == b.spec);
        if same {
            Ok(())
        } else {
            Err(ConsistencyError::InvalidBatch {
                reason: "column layouts differ".to_string(),
            }
            .into())
        }
    }

    /// Appends rows `range` of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::InvalidBatch`] if the column layouts differ,
    /// or [`TesselError::OutOfMemory`].
    pub fn copy_rows_from(&mut self, src: &Self, range: std::ops::Range<usize>) -> Result<()> {
        self.check_layout(src)?;
        let n = range.len();
        for col in &mut self.cols {
            col.reserve(n)?;
        }
        for row in range {
            for (dst, s) in self.cols.iter_mut().zip(&src.cols) {
                dst.push_from(s, row);
            }
        }
        self.rows += n;
        Ok(())
    }

    /// Copies rows `range` restricted to the columns in `col_ids` (every
    /// column if `None`). The key column is always kept.
    ///
    /// # Errors
    ///
    /// Returns [`TesselError::OutOfMemory`].
    pub fn project(&self, col_ids: Option<&[i16]>, range: std::ops::Range<usize>) -> Result<Self> {
        let mut cols = Vec::with_capacity(self.cols.len());
        for (pos, col) in self.cols.iter().enumerate() {
            if pos != 0 && col_ids.is_some_and(|ids| !ids.contains(&col.spec.id)) {
                continue;
            }
            let w = col.spec.ty.width();
            let mut out = ColumnData::new(col.spec);
            out.reserve(range.len())?;
            out.data
                .extend_from_slice(&col.data[range.start * w..range.end * w]);
            out.nulls.extend_from_slice(&col.nulls[range.clone()]);
            cols.push(out);
        }
        Ok(Self {
            sversion: self.sversion,
            cols,
            rows: range.len(),
        })
    }

    /// Replaces the contents with the sorted union of `existing` and the
    /// first `incoming_rows` rows of `incoming`. On equal keys the existing
    /// row is kept and the incoming row dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError::InvalidBatch`] if the column layouts differ,
    /// or [`TesselError::OutOfMemory`].
    pub fn merge_sorted(
        &mut self,
        existing: &Self,
        incoming: &Self,
        incoming_rows: usize,
    ) -> Result<MergeCounts> {
        existing.check_layout(incoming)?;
        self.clear();
        let same_layout = self.cols.len() == existing.cols.len()
            && self.cols.iter().zip(&existing.cols).all(|(a, b)| a.spec == b.spec);
        if !same_layout {
            self.cols = existing.cols.iter().map(|c| ColumnData::new(c.spec)).collect();
        }
        self.sversion = incoming.sversion.max(existing.sversion);
        for col in &mut self.cols {
            col.reserve(existing.rows + incoming_rows)?;
        }

        let mut counts = MergeCounts::default();
        let (mut i, mut j) = (0, 0);
        while i < existing.rows || j < incoming_rows {
            let take_existing = if i >= existing.rows {
                false
            } else if j >= incoming_rows {
                true
            } else {
                let (ke, ki) = (existing.key_at(i), incoming.key_at(j));
                if ke == ki {
                    j += 1;
                    counts.duplicates += 1;
                }
                ke <= ki
            };
            let (src, row) = if take_existing {
                i += 1;
                counts.existing += 1;
                (existing, i - 1)
            } else {
                j += 1;
                counts.added += 1;
                (incoming, j - 1)
            };
            for (dst, s) in self.cols.iter_mut().zip(&src.cols) {
                dst.push_from(s, row);
            }
            self.rows += 1;
        }
        Ok(counts)
    }
}
