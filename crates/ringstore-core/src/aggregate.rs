//! The aggregation operator (§4.3): per-key, per-column reductions over a
//! sample sequence. This is the principal reader of the ring engine and
//! defines the semantic contract the engine preserves across sample
//! boundaries — it has no dependency on any particular backend.

use std::collections::BTreeMap;

use crate::error::{Result, RingStoreError};
use crate::table::{ColumnInfo, Table, COL_DUR, COL_SEQ, COL_TIME};

/// The eight reduction functions the operator supports (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    Avg,
    Min,
    Max,
    Sum,
    First,
    Last,
    Diff,
    Rate,
}

impl AggFn {
    /// Reduces a non-empty slice of samples in order (first..last).
    fn apply(self, values: &[f64], span: f64) -> f64 {
        match self {
            AggFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggFn::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggFn::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggFn::Sum => values.iter().sum(),
            AggFn::First => values[0],
            AggFn::Last => values[values.len() - 1],
            AggFn::Diff => values[values.len() - 1] - values[0],
            AggFn::Rate => {
                if span > 0.0 {
                    (values[values.len() - 1] - values[0]) / span
                } else {
                    0.0
                }
            }
        }
    }
}

/// Runs the aggregation operator over `input` with function `func`,
/// producing a single-sample-per-group result table (§4.3).
///
/// Fails with `Invalid` if the input is empty or lacks `_time` (§4.3 step
/// 1; §7).
pub fn aggregate(input: &Table, func: AggFn) -> Result<Table> {
    if input.is_empty() {
        return Err(RingStoreError::Invalid("aggregation input is empty".into()));
    }
    let time_idx = input
        .column_index(COL_TIME)
        .ok_or_else(|| RingStoreError::Invalid("aggregation input has no _time column".into()))?;

    let key_col = input.primary_key_column().map(|s| s.to_string());

    // Partition rows into groups keyed by the primary-key column, or a
    // single implicit group if none is marked (§4.3 step 2).
    let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    let mut group_index: BTreeMap<Option<String>, usize> = BTreeMap::new();
    for (row_idx, row) in input.rows.iter().enumerate() {
        let key_value = key_col
            .as_ref()
            .map(|col| row[input.column_index(col).unwrap()].clone());
        let gi = *group_index.entry(key_value.clone()).or_insert_with(|| {
            groups.push((key_value, Vec::new()));
            groups.len() - 1
        });
        groups[gi].1.push(row_idx);
    }

    // Time span is computed over the whole input, not per-group (§4.3
    // step 3): t_first/t_last are the first/last row of the input in
    // order, duration from the first row's _dur (or 0).
    let t_first: f64 = input.rows[0][time_idx].parse().unwrap_or(0.0);
    let t_last: f64 = input.rows[input.rows.len() - 1][time_idx]
        .parse()
        .unwrap_or(0.0);
    let duration = input
        .column_index(COL_DUR)
        .and_then(|i| input.rows[0][i].parse::<f64>().ok())
        .unwrap_or(0.0);
    let span = t_last - t_first + duration;

    let mut out = Table::new(input.columns.clone());
    out.info = input.info.clone();

    let dur_idx = input.column_index(COL_DUR);

    for (_, row_indices) in &groups {
        let last_row_idx = *row_indices.last().unwrap();
        let mut out_row = vec![String::new(); input.columns.len()];

        for (col_idx, col_name) in input.columns.iter().enumerate() {
            if col_name == COL_SEQ {
                out_row[col_idx] = "0".to_string();
                continue;
            }
            if col_name == COL_TIME || Some(col_idx) == dur_idx {
                out_row[col_idx] = input.rows[last_row_idx][col_idx].clone();
                continue;
            }
            let is_string = input
                .info
                .get(col_name)
                .map(ColumnInfo::is_string)
                .unwrap_or(false);
            if is_string {
                out_row[col_idx] = input.rows[last_row_idx][col_idx].clone();
                continue;
            }
            let values: Vec<f64> = row_indices
                .iter()
                .filter_map(|&ri| input.rows[ri][col_idx].parse::<f64>().ok())
                .collect();
            if values.is_empty() {
                out_row[col_idx] = input.rows[last_row_idx][col_idx].clone();
                continue;
            }
            let reduced = func.apply(&values, span);
            out_row[col_idx] = format_f64(reduced);
        }
        out.push_row(out_row);
    }

    Ok(out)
}

fn format_f64(v: f64) -> String {
    format!("{:.2}", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_instance_table() -> Table {
        let mut t = Table::new(vec![
            COL_TIME.into(),
            "col1".into(),
            "col2".into(),
            "col3".into(),
            "thing".into(),
        ]);
        t.info.insert(
            "thing".into(),
            ColumnInfo {
                key: Some(1),
                type_tag: Some("str".into()),
                ..Default::default()
            },
        );
        let rows = [
            (5, 1.00, 2.00, 3.00, "thing1"),
            (5, 10.00, 20.00, 30.00, "thing2"),
            (10, 1.00, 2.00, 3.00, "thing1"),
            (10, 16.00, 23.00, 30.00, "thing2"),
            (15, 1.00, 2.00, 3.00, "thing1"),
            (15, 18.00, 26.00, 30.00, "thing2"),
        ];
        for (time, c1, c2, c3, thing) in rows {
            t.push_row(vec![
                time.to_string(),
                format!("{:.2}", c1),
                format!("{:.2}", c2),
                format!("{:.2}", c3),
                thing.to_string(),
            ]);
        }
        t
    }

    #[test]
    fn avg_groups_by_primary_key() {
        let t = multi_instance_table();
        let out = aggregate(&t, AggFn::Avg).unwrap();
        assert_eq!(out.rows.len(), 2);
        let thing2 = out
            .rows
            .iter()
            .find(|r| r[4] == "thing2")
            .expect("thing2 row");
        assert_eq!(thing2[1], "14.67");
        assert_eq!(thing2[2], "23.00");
        assert_eq!(thing2[3], "30.00");
        assert_eq!(thing2[0], "15"); // _time = last sample's time
    }

    #[test]
    fn sum_min_max_over_group() {
        let t = multi_instance_table();
        let sum = aggregate(&t, AggFn::Sum).unwrap();
        let thing2 = sum.rows.iter().find(|r| r[4] == "thing2").unwrap();
        assert_eq!(thing2[1], "44.00");
        assert_eq!(thing2[2], "69.00");
        assert_eq!(thing2[3], "90.00");

        let min = aggregate(&t, AggFn::Min).unwrap();
        let thing2 = min.rows.iter().find(|r| r[4] == "thing2").unwrap();
        assert_eq!(thing2[1], "10.00");
        assert_eq!(thing2[2], "20.00");

        let max = aggregate(&t, AggFn::Max).unwrap();
        let thing2 = max.rows.iter().find(|r| r[4] == "thing2").unwrap();
        assert_eq!(thing2[1], "18.00");
        assert_eq!(thing2[2], "26.00");
    }

    #[test]
    fn single_sample_is_pass_through() {
        let mut t = Table::new(vec![COL_TIME.into(), "val".into()]);
        t.push_row(vec!["10".into(), "5.0".into()]);
        let out = aggregate(&t, AggFn::Avg).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0][1], "5.00");
    }

    #[test]
    fn empty_input_is_invalid() {
        let t = Table::new(vec![COL_TIME.into(), "val".into()]);
        assert!(matches!(
            aggregate(&t, AggFn::Avg),
            Err(RingStoreError::Invalid(_))
        ));
    }

    #[test]
    fn missing_time_column_is_invalid() {
        let mut t = Table::new(vec!["val".into()]);
        t.push_row(vec!["1".into()]);
        assert!(matches!(
            aggregate(&t, AggFn::Avg),
            Err(RingStoreError::Invalid(_))
        ));
    }

    #[test]
    fn rate_uses_span_and_diff_subtracts_endpoints() {
        let mut t = Table::new(vec![COL_TIME.into(), COL_DUR.into(), "val".into()]);
        t.push_row(vec!["0".into(), "5".into(), "10".into()]);
        t.push_row(vec!["10".into(), "5".into(), "30".into()]);
        let diff = aggregate(&t, AggFn::Diff).unwrap();
        assert_eq!(diff.rows[0][2], "20.00");
        let rate = aggregate(&t, AggFn::Rate).unwrap();
        // span = 10 - 0 + 5 = 15; rate = 20/15
        let v: f64 = rate.rows[0][2].parse().unwrap();
        assert!((v - (20.0 / 15.0)).abs() < 1e-9);
    }

    #[test]
    fn rate_with_zero_span_is_zero() {
        let mut t = Table::new(vec![COL_TIME.into(), "val".into()]);
        t.push_row(vec!["5".into(), "10".into()]);
        t.push_row(vec!["5".into(), "30".into()]);
        let rate = aggregate(&t, AggFn::Rate).unwrap();
        assert_eq!(rate.rows[0][1], "0.00");
    }
}
