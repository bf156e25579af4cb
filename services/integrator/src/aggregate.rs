//! Aggregator - records grouped by entity key
//!
//! Responsibilities:
//! - One output row per distinct non-null key value, never an empty group
//! - Reductions: mean, rate (mean x 100), sum, count, count_distinct, first
//! - Rows ordered by key, accumulation in input order
//!
//! Rate scaling lives here and only here; callers never multiply by 100.
//!
//! This module is DETERMINISTIC: same records in the same order = identical
//! aggregate rows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::AggregateError;
use crate::table::{Key, Table, Value};

pub const DROPOUT_RATE: &str = "TAXA_ABANDONO";
pub const STUDENT_COUNT: &str = "TOTAL_ALUNOS";
pub const SCHOOL_COUNT: &str = "TOTAL_ESCOLAS";
pub const MEAN_DISTORTION: &str = "DISTORCAO_MEDIA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Mean of non-null numeric values.
    Mean,
    /// Mean of a 0/1 flag, scaled to a percentage.
    Rate,
    Sum,
    /// Records contributing to the key, nulls included.
    Count,
    /// Distinct non-null values.
    CountDistinct,
    /// Value of the first record of the group, even when null.
    First,
}

#[derive(Debug, Clone)]
pub struct FieldReduction {
    pub source: String,
    pub op: Reduction,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub key: String,
    pub fields: Vec<FieldReduction>,
}

impl AggregateSpec {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fields: Vec::new(),
        }
    }

    /// Add a reduction of `source` written to `output`.
    pub fn field(mut self, source: &str, op: Reduction, output: &str) -> Self {
        self.fields.push(FieldReduction {
            source: source.to_string(),
            op,
            output: output.to_string(),
        });
        self
    }

    /// Enrollment records to one row per school.
    pub fn school() -> Self {
        Self::new("CO_ENTIDADE")
            .field("CO_MUNICIPIO", Reduction::First, "CO_MUNICIPIO")
            .field("CO_UF", Reduction::First, "CO_UF")
            .field("TP_DEPENDENCIA", Reduction::First, "TP_DEPENDENCIA")
            .field("TP_LOCALIZACAO", Reduction::First, "TP_LOCALIZACAO")
            .field("ABANDONO", Reduction::Rate, DROPOUT_RATE)
            .field("CO_ENTIDADE", Reduction::Count, STUDENT_COUNT)
            .field("DISTORCAO_IDADE_SERIE", Reduction::Mean, MEAN_DISTORTION)
    }

    /// Enrollment records to one row per municipality.
    pub fn municipality() -> Self {
        Self::new("CO_MUNICIPIO")
            .field("CO_UF", Reduction::First, "CO_UF")
            .field("ABANDONO", Reduction::Rate, DROPOUT_RATE)
            .field("CO_MUNICIPIO", Reduction::Count, STUDENT_COUNT)
            .field("CO_ENTIDADE", Reduction::CountDistinct, SCHOOL_COUNT)
            .field("DISTORCAO_IDADE_SERIE", Reduction::Mean, MEAN_DISTORTION)
    }

    /// Mean of every numeric column of `table` accepted by `select`, keyed by
    /// `key`. Output columns are named `prefix + column`.
    pub fn numeric_means<F>(table: &Table, key: &str, prefix: &str, select: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        table
            .numeric_columns()
            .iter()
            .filter(|c| c.as_str() != key && select(c))
            .fold(Self::new(key), |spec, c| {
                spec.field(c, Reduction::Mean, &format!("{}{}", prefix, c))
            })
    }
}

#[derive(Debug, Clone)]
pub struct Aggregated {
    pub table: Table,
    /// Records excluded because their key was null.
    pub null_keys: usize,
    /// Reductions dropped because their source column is absent.
    pub skipped_fields: Vec<String>,
}

enum Accumulator {
    Mean { sum: f64, n: usize, scale: f64 },
    Sum { ints: i64, floats: f64, any_float: bool, n: usize },
    Count(usize),
    Distinct(BTreeSet<Key>),
    First(Option<Value>),
}

impl Accumulator {
    fn new(op: Reduction) -> Self {
        match op {
            Reduction::Mean => Accumulator::Mean { sum: 0.0, n: 0, scale: 1.0 },
            Reduction::Rate => Accumulator::Mean { sum: 0.0, n: 0, scale: 100.0 },
            Reduction::Sum => Accumulator::Sum {
                ints: 0,
                floats: 0.0,
                any_float: false,
                n: 0,
            },
            Reduction::Count => Accumulator::Count(0),
            Reduction::CountDistinct => Accumulator::Distinct(BTreeSet::new()),
            Reduction::First => Accumulator::First(None),
        }
    }

    fn push(&mut self, value: Option<&Value>) {
        match self {
            Accumulator::Mean { sum, n, .. } => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *sum += x;
                    *n += 1;
                }
            }
            Accumulator::Sum { ints, floats, any_float, n } => match value {
                Some(Value::Int(i)) => {
                    // Past i64 range the sum continues in floating point.
                    match ints.checked_add(*i) {
                        Some(total) => *ints = total,
                        None => {
                            *floats += *i as f64;
                            *any_float = true;
                        }
                    }
                    *n += 1;
                }
                Some(Value::Float(f)) => {
                    *floats += f;
                    *any_float = true;
                    *n += 1;
                }
                _ => {}
            },
            Accumulator::Count(n) => *n += 1,
            Accumulator::Distinct(seen) => {
                if let Some(k) = value.and_then(Key::from_value) {
                    seen.insert(k);
                }
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value.cloned().unwrap_or(Value::Null));
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Mean { n: 0, .. } => Value::Null,
            Accumulator::Mean { sum, n, scale } => Value::Float(sum * scale / n as f64),
            Accumulator::Sum { n: 0, .. } => Value::Null,
            Accumulator::Sum { ints, any_float: false, .. } => Value::Int(ints),
            Accumulator::Sum { ints, floats, .. } => Value::Float(ints as f64 + floats),
            Accumulator::Count(n) => Value::Int(n as i64),
            Accumulator::Distinct(seen) => Value::Int(seen.len() as i64),
            Accumulator::First(first) => first.unwrap_or(Value::Null),
        }
    }
}

/// Group `table` by `spec.key` and reduce.
pub fn aggregate(table: &Table, spec: &AggregateSpec) -> Result<Aggregated, AggregateError> {
    let key_idx = table
        .column_index(&spec.key)
        .ok_or_else(|| AggregateError::MissingKey {
            key: spec.key.clone(),
        })?;

    // Count needs no source column; every other reduction does.
    let mut active: Vec<(&FieldReduction, Option<usize>)> = Vec::new();
    let mut skipped_fields = Vec::new();
    for field in &spec.fields {
        match (table.column_index(&field.source), field.op) {
            (idx, Reduction::Count) => active.push((field, idx)),
            (Some(idx), _) => active.push((field, Some(idx))),
            (None, _) => skipped_fields.push(field.source.clone()),
        }
    }

    let mut groups: BTreeMap<Key, Vec<Accumulator>> = BTreeMap::new();
    let mut null_keys = 0;
    for row in table.rows() {
        let Some(key) = Key::from_value(&row[key_idx]) else {
            null_keys += 1;
            continue;
        };
        let accs = groups
            .entry(key)
            .or_insert_with(|| active.iter().map(|(f, _)| Accumulator::new(f.op)).collect());
        for (acc, (_, idx)) in accs.iter_mut().zip(&active) {
            acc.push(idx.map(|i| &row[i]));
        }
    }

    let mut columns = vec![spec.key.clone()];
    columns.extend(active.iter().map(|(f, _)| f.output.clone()));
    let mut out = Table::new(columns);
    for (key, accs) in groups {
        let mut row = Vec::with_capacity(accs.len() + 1);
        row.push(key.to_value());
        row.extend(accs.into_iter().map(Accumulator::finish));
        out.push_row(row);
    }

    debug!(
        key = %spec.key,
        groups = out.len(),
        null_keys,
        skipped = skipped_fields.len(),
        "aggregated"
    );
    Ok(Aggregated {
        table: out,
        null_keys,
        skipped_fields,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// `[A:10/2, B:5/0, C:8/4]` as enrollment records, interleaved.
    fn enrollments() -> Table {
        let mut rows = Vec::new();
        for (school, total, dropouts) in [("A", 10, 2), ("B", 5, 0), ("C", 8, 4)] {
            for i in 0..total {
                rows.push(vec![Value::from(school), Value::Int(i64::from(i < dropouts))]);
            }
        }
        Table::from_rows(&["CO_ENTIDADE", "ABANDONO"], rows)
    }

    // -------------------------------------------------------------------------
    // RATE SCENARIO
    // -------------------------------------------------------------------------

    #[test]
    fn test_dropout_rate_scenario() {
        let spec = AggregateSpec::school();
        let out = aggregate(&enrollments(), &spec).unwrap().table;
        assert_eq!(out.len(), 3);
        assert_eq!(out.get(0, "CO_ENTIDADE"), Some(&Value::from("A")));
        assert_eq!(out.get(0, DROPOUT_RATE), Some(&Value::Float(20.0)));
        assert_eq!(out.get(1, DROPOUT_RATE), Some(&Value::Float(0.0)));
        assert_eq!(out.get(2, DROPOUT_RATE), Some(&Value::Float(50.0)));
        assert_eq!(out.get(0, STUDENT_COUNT), Some(&Value::Int(10)));
        assert_eq!(out.get(2, STUDENT_COUNT), Some(&Value::Int(8)));
    }

    #[test]
    fn test_absent_source_columns_are_skipped() {
        let agg = aggregate(&enrollments(), &AggregateSpec::school()).unwrap();
        assert!(!agg.table.has_column("TP_DEPENDENCIA"));
        assert!(agg.skipped_fields.contains(&"TP_DEPENDENCIA".to_string()));
        assert!(agg.table.has_column(STUDENT_COUNT));
    }

    // -------------------------------------------------------------------------
    // REDUCTIONS
    // -------------------------------------------------------------------------

    #[test]
    fn test_first_takes_first_record_even_when_null() {
        let t = Table::from_rows(
            &["K", "DEP"],
            vec![
                vec![Value::Int(1), Value::Null],
                vec![Value::Int(1), Value::from("Estadual")],
                vec![Value::Int(2), Value::from("Municipal")],
            ],
        );
        let spec = AggregateSpec::new("K").field("DEP", Reduction::First, "DEP");
        let out = aggregate(&t, &spec).unwrap().table;
        assert_eq!(out.get(0, "DEP"), Some(&Value::Null));
        assert_eq!(out.get(1, "DEP"), Some(&Value::from("Municipal")));
    }

    #[test]
    fn test_count_ignores_nulls_in_other_fields() {
        let t = Table::from_rows(
            &["K", "X"],
            vec![
                vec![Value::Int(1), Value::Null],
                vec![Value::Int(1), Value::Int(2)],
            ],
        );
        let spec = AggregateSpec::new("K")
            .field("K", Reduction::Count, "N")
            .field("X", Reduction::Mean, "X_MEAN")
            .field("X", Reduction::Sum, "X_SUM");
        let out = aggregate(&t, &spec).unwrap().table;
        assert_eq!(out.get(0, "N"), Some(&Value::Int(2)));
        assert_eq!(out.get(0, "X_MEAN"), Some(&Value::Float(2.0)));
        assert_eq!(out.get(0, "X_SUM"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_integer_sum_overflow_continues_as_float() {
        let t = Table::from_rows(
            &["K", "X"],
            vec![
                vec![Value::Int(1), Value::Int(i64::MAX)],
                vec![Value::Int(1), Value::Int(i64::MAX)],
                vec![Value::Int(2), Value::Int(i64::MAX)],
            ],
        );
        let spec = AggregateSpec::new("K").field("X", Reduction::Sum, "X_SUM");
        let out = aggregate(&t, &spec).unwrap().table;
        assert_eq!(out.get(0, "X_SUM"), Some(&Value::Float(i64::MAX as f64 * 2.0)));
        assert_eq!(out.get(1, "X_SUM"), Some(&Value::Int(i64::MAX)));
    }

    #[test]
    fn test_count_distinct_schools_per_municipality() {
        let t = Table::from_rows(
            &["CO_MUNICIPIO", "CO_ENTIDADE", "ABANDONO"],
            vec![
                vec![Value::Int(3550308), Value::Int(10), Value::Int(0)],
                vec![Value::Int(3550308), Value::Int(10), Value::Int(1)],
                vec![Value::Int(3550308), Value::Int(11), Value::Int(0)],
                vec![Value::Int(3304557), Value::Null, Value::Int(0)],
            ],
        );
        let out = aggregate(&t, &AggregateSpec::municipality()).unwrap().table;
        // Rows are ordered by key.
        assert_eq!(out.get(0, "CO_MUNICIPIO"), Some(&Value::Int(3304557)));
        assert_eq!(out.get(0, SCHOOL_COUNT), Some(&Value::Int(0)));
        assert_eq!(out.get(1, SCHOOL_COUNT), Some(&Value::Int(2)));
        assert_eq!(out.get(1, STUDENT_COUNT), Some(&Value::Int(3)));
    }

    #[test]
    fn test_null_keys_are_excluded_and_counted() {
        let t = Table::from_rows(
            &["K", "ABANDONO"],
            vec![
                vec![Value::Null, Value::Int(1)],
                vec![Value::Int(1), Value::Int(0)],
            ],
        );
        let spec = AggregateSpec::new("K").field("ABANDONO", Reduction::Rate, DROPOUT_RATE);
        let agg = aggregate(&t, &spec).unwrap();
        assert_eq!(agg.table.len(), 1);
        assert_eq!(agg.null_keys, 1);
    }

    #[test]
    fn test_missing_key_column_is_error() {
        let err = aggregate(&enrollments(), &AggregateSpec::municipality()).unwrap_err();
        assert!(matches!(err, AggregateError::MissingKey { .. }));
    }

    #[test]
    fn test_numeric_means_spec() {
        let t = Table::from_rows(
            &["UF", "RENDA", "NOME", "PROFICIENCIA_MT"],
            vec![
                vec![Value::Int(35), Value::Float(1000.0), Value::from("x"), Value::Float(250.0)],
                vec![Value::Int(35), Value::Float(3000.0), Value::from("y"), Value::Float(270.0)],
            ],
        );
        let spec = AggregateSpec::numeric_means(&t, "UF", "PNAD_", |_| true);
        let out = aggregate(&t, &spec).unwrap().table;
        assert_eq!(
            out.columns(),
            &["UF".to_string(), "PNAD_RENDA".to_string(), "PNAD_PROFICIENCIA_MT".to_string()]
        );
        assert_eq!(out.get(0, "PNAD_RENDA"), Some(&Value::Float(2000.0)));

        let spec = AggregateSpec::numeric_means(&t, "UF", "", |c| c.contains("PROFICIENCIA"));
        assert_eq!(spec.fields.len(), 1);
    }

    // -------------------------------------------------------------------------
    // DETERMINISM
    // -------------------------------------------------------------------------

    #[test]
    fn test_aggregation_determinism() {
        let spec = AggregateSpec::school();
        let a = aggregate(&enrollments(), &spec).unwrap().table;
        let b = aggregate(&enrollments(), &spec).unwrap().table;
        assert_eq!(a, b);
        let render = |t: &Table| format!("{:?}", t.rows());
        assert_eq!(render(&a), render(&b));
    }
}
