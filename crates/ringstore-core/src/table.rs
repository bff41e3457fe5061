//! The tabular value type samples are made of: an ordered column list, an
//! ordered row list, and a sparse per-column info sidecar.
//!
//! Wire form is tab-separated columns, newline-separated rows, with an
//! optional info sidecar preceding a `--` ruler line (§6 of the aggregation
//! table format).

use std::collections::BTreeMap;
use std::fmt;

/// Reserved column names that carry ring metadata rather than sample data.
pub const COL_SEQ: &str = "_seq";
pub const COL_TIME: &str = "_time";
pub const COL_DUR: &str = "_dur";

pub fn is_meta_column(name: &str) -> bool {
    matches!(name, COL_SEQ | COL_TIME | COL_DUR)
}

/// Per-column metadata: key precedence, type tag, free-text info, display
/// name, numeric bound. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnInfo {
    /// Key precedence; `Some(1)` marks the primary instance key (§3).
    pub key: Option<u32>,
    /// `Some("str")` marks a column whose values are never aggregated
    /// numerically.
    pub type_tag: Option<String>,
    pub info: Option<String>,
    pub display_name: Option<String>,
    pub max: Option<f64>,
}

impl ColumnInfo {
    pub fn is_string(&self) -> bool {
        self.type_tag.as_deref() == Some("str")
    }

    pub fn is_primary_key(&self) -> bool {
        self.key == Some(1)
    }
}

/// A tabular value: columns, rows, and a sparse info sidecar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub info: BTreeMap<String, ColumnInfo>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            info: BTreeMap::new(),
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn push_row(&mut self, values: Vec<String>) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(values);
    }

    pub fn get(&self, row: usize, col: &str) -> Option<&str> {
        let idx = self.column_index(col)?;
        self.rows.get(row).and_then(|r| r.get(idx)).map(|s| s.as_str())
    }

    pub fn get_f64(&self, row: usize, col: &str) -> Option<f64> {
        self.get(row, col).and_then(|v| v.parse::<f64>().ok())
    }

    /// The column marked `key=1` in the info sidecar, if any (§3, §4.3).
    pub fn primary_key_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| self.info.get(*c).map(|i| i.is_primary_key()).unwrap_or(false))
            .map(|s| s.as_str())
    }

    /// Returns a new table containing only the columns not named `_seq`,
    /// `_time`, or `_dur`, and without those three columns' info rows.
    /// Used when splitting a `put` table into data-block bodies (§4.2.2).
    pub fn without_meta_columns(&self) -> Self {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !is_meta_column(c))
            .map(|(i, _)| i)
            .collect();
        let columns: Vec<String> = keep.iter().map(|&i| self.columns[i].clone()).collect();
        let info = self
            .info
            .iter()
            .filter(|(k, _)| !is_meta_column(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Self { columns, info, rows }
    }

    /// Serializes just the row body (no header, no info sidecar) as
    /// tab-separated lines. This is what is stored in a data block; the
    /// schema lives in the header dictionary instead (§3, §6).
    pub fn serialize_body(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }

    /// Parses a data-block body against a known column list.
    pub fn parse_body(columns: Vec<String>, body: &str) -> Self {
        let rows = body
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.split('\t').map(|s| s.to_string()).collect())
            .collect();
        Self {
            columns,
            info: BTreeMap::new(),
            rows,
        }
    }

    /// Serializes the header line plus info sidecar, as stored in the header
    /// dictionary (§4.2.6): `col1\tcol2\t...\ninfo:key\t<col>\t1\n...\n--`.
    pub fn serialize_header(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.columns.join("\t"));
        out.push('\n');
        for col in &self.columns {
            if let Some(info) = self.info.get(col) {
                if let Some(k) = info.key {
                    out.push_str(&format!("info:key\t{}\t{}\n", col, k));
                }
                if let Some(t) = &info.type_tag {
                    out.push_str(&format!("info:type\t{}\t{}\n", col, t));
                }
                if let Some(i) = &info.info {
                    out.push_str(&format!("info:info\t{}\t{}\n", col, i));
                }
                if let Some(n) = &info.display_name {
                    out.push_str(&format!("info:name\t{}\t{}\n", col, n));
                }
                if let Some(m) = info.max {
                    out.push_str(&format!("info:max\t{}\t{}\n", col, m));
                }
            }
        }
        out.push_str("--");
        out
    }

    /// Parses a header dictionary entry back into an (empty-rows) table.
    pub fn parse_header(text: &str) -> Self {
        let mut lines = text.lines();
        let columns: Vec<String> = lines
            .next()
            .unwrap_or("")
            .split('\t')
            .map(|s| s.to_string())
            .collect();
        let mut info: BTreeMap<String, ColumnInfo> = BTreeMap::new();
        for line in lines {
            if line == "--" {
                break;
            }
            let mut parts = line.splitn(3, '\t');
            let tag = parts.next().unwrap_or("");
            let col = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            let entry = info.entry(col.to_string()).or_default();
            match tag {
                "info:key" => entry.key = value.parse().ok(),
                "info:type" => entry.type_tag = Some(value.to_string()),
                "info:info" => entry.info = Some(value.to_string()),
                "info:name" => entry.display_name = Some(value.to_string()),
                "info:max" => entry.max = value.parse().ok(),
                _ => {}
            }
        }
        Self {
            columns,
            info,
            rows: Vec::new(),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.columns.join("\t"))?;
        for row in &self.rows {
            writeln!(f, "{}", row.join("\t"))?;
        }
        Ok(())
    }
}
