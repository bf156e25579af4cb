//! Consistency Checker - post-join validation of an integrated table
//!
//! Responsibilities:
//! - Clamp rate columns into [0, 100] and report how many rows moved
//! - Report per-column missing values
//! - Compare correlation signs against documented expectations
//!
//! Imputation is a separate call (`impute_missing`), never part of `check`.
//! Nothing in here is fatal: findings are collected into `Diagnostics`.

use serde::Serialize;
use tracing::warn;

use crate::table::{Table, Value};

pub const RATE_MIN: f64 = 0.0;
pub const RATE_MAX: f64 = 100.0;

/// Label written into categorical cells by `impute_missing`.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Minimum paired observations for a correlation to be reported.
const MIN_CORRELATION_PAIRS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    Positive,
    Negative,
}

/// Covariates whose relation to the dropout rate has a documented direction.
pub const EXPECTED_SIGNS: &[(&str, Sign)] = &[
    ("TAXA_POBREZA", Sign::Positive),
    ("TAXA_DESEMPREGO", Sign::Positive),
    ("INDICE_GINI", Sign::Positive),
    ("DISTORCAO_MEDIA", Sign::Positive),
    ("IDEB", Sign::Negative),
    ("INDICE_INFRAESTRUTURA", Sign::Negative),
];

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub bounds: bool,
    pub missing_report: bool,
    pub correlations: bool,
    /// Column the correlation check is run against.
    pub target: String,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            bounds: true,
            missing_report: true,
            correlations: true,
            target: "TAXA_ABANDONO".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClampReport {
    pub column: String,
    pub clamped_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingReport {
    pub column: String,
    pub nulls: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationCheck {
    pub covariate: String,
    pub expected: Sign,
    pub coefficient: f64,
    pub pairs: usize,
    pub unexpected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputationReport {
    pub column: String,
    pub filled: usize,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub clamped: Vec<ClampReport>,
    pub missing: Vec<MissingReport>,
    pub correlations: Vec<CorrelationCheck>,
    pub imputed: Vec<ImputationReport>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn total_clamped(&self) -> usize {
        self.clamped.iter().map(|c| c.clamped_rows).sum()
    }
}

/// Rate columns are percentages by naming convention.
pub fn is_rate_column(name: &str) -> bool {
    name.starts_with("TAXA_") || name.starts_with("PNAD_TAXA_")
}

/// Run the enabled checks. Only the bounds check changes the table.
pub fn check(table: Table, options: &CheckOptions) -> (Table, Diagnostics) {
    let (table, mut diagnostics) = if options.bounds {
        enforce_bounds(table)
    } else {
        (table, Diagnostics::default())
    };
    inspect(&table, options, &mut diagnostics);
    (table, diagnostics)
}

/// Bounds pass on its own, for callers that derive columns from rates and
/// must do so from the clamped values.
pub fn enforce_bounds(table: Table) -> (Table, Diagnostics) {
    let mut diagnostics = Diagnostics::default();
    let (table, clamped) = clamp_rates(table);
    for c in &clamped {
        diagnostics.warnings.push(format!(
            "{} row(s) of {} outside [{}, {}] were clamped",
            c.clamped_rows, c.column, RATE_MIN, RATE_MAX
        ));
    }
    diagnostics.clamped = clamped;
    (table, diagnostics)
}

/// Read-only checks: missing values and correlation signs.
pub fn inspect(table: &Table, options: &CheckOptions, diagnostics: &mut Diagnostics) {
    if options.missing_report {
        diagnostics.missing = missing_values(table);
    }

    if options.correlations {
        diagnostics.correlations = correlation_signs(table, &options.target);
        for c in diagnostics.correlations.iter().filter(|c| c.unexpected) {
            diagnostics.warnings.push(format!(
                "correlation between {} and {} is {:.3}, expected {:?}",
                options.target, c.covariate, c.coefficient, c.expected
            ));
        }
    }
}

// =============================================================================
// BOUNDS
// =============================================================================

pub fn clamp_rates(mut table: Table) -> (Table, Vec<ClampReport>) {
    let rate_columns: Vec<(usize, String)> = table
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| is_rate_column(c))
        .map(|(i, c)| (i, c.clone()))
        .collect();

    let mut reports = Vec::new();
    for (idx, column) in rate_columns {
        let mut clamped_rows = 0;
        for row in table.rows_mut() {
            let clamped = match &row[idx] {
                Value::Float(x) if *x < RATE_MIN || *x > RATE_MAX => {
                    Some(Value::Float(x.clamp(RATE_MIN, RATE_MAX)))
                }
                Value::Int(i) if (*i as f64) < RATE_MIN || (*i as f64) > RATE_MAX => {
                    Some(Value::Int((*i).clamp(RATE_MIN as i64, RATE_MAX as i64)))
                }
                _ => None,
            };
            if let Some(v) = clamped {
                row[idx] = v;
                clamped_rows += 1;
            }
        }
        if clamped_rows > 0 {
            warn!(column = %column, clamped_rows, "rate values out of bounds were clamped");
            reports.push(ClampReport {
                column,
                clamped_rows,
            });
        }
    }
    (table, reports)
}

// =============================================================================
// MISSING VALUES
// =============================================================================

/// Null count and percentage for every column, in table order.
pub fn missing_values(table: &Table) -> Vec<MissingReport> {
    let total = table.len();
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let nulls = table.rows().iter().filter(|r| r[i].is_null()).count();
            let percent = if total == 0 {
                0.0
            } else {
                nulls as f64 * 100.0 / total as f64
            };
            MissingReport {
                column: column.clone(),
                nulls,
                percent,
            }
        })
        .collect()
}

/// Fill nulls: numeric columns with their mean, other columns with
/// `UNKNOWN_LABEL`. Columns with no value at all are left untouched.
pub fn impute_missing(mut table: Table) -> (Table, Vec<ImputationReport>) {
    let numeric = table.numeric_columns();
    let mut fills = Vec::new();
    for (idx, column) in table.columns().iter().enumerate() {
        let present: Vec<&Value> = table
            .rows()
            .iter()
            .map(|r| &r[idx])
            .filter(|v| !v.is_null())
            .collect();
        if present.is_empty() || present.len() == table.len() {
            continue;
        }
        let fill = if numeric.contains(column) {
            let values: Vec<f64> = present.iter().filter_map(|v| v.as_f64()).collect();
            Value::Float(values.iter().sum::<f64>() / values.len() as f64)
        } else {
            Value::from(UNKNOWN_LABEL)
        };
        fills.push((idx, column.clone(), fill));
    }

    let mut reports = Vec::with_capacity(fills.len());
    for (idx, column, value) in fills {
        let mut filled = 0;
        for row in table.rows_mut() {
            if row[idx].is_null() {
                row[idx] = value.clone();
                filled += 1;
            }
        }
        reports.push(ImputationReport {
            column,
            filled,
            value,
        });
    }
    (table, reports)
}

// =============================================================================
// CORRELATION SIGNS
// =============================================================================

/// Pearson coefficient over the pairs where both values are present.
/// `None` with fewer than three pairs or zero variance.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    let n = pairs.len();
    if n < MIN_CORRELATION_PAIRS {
        return None;
    }
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n as f64;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n as f64;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let (dx, dy) = (x - mean_x, y - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

/// Correlations of `target` with each covariate in `EXPECTED_SIGNS` present
/// in the table.
pub fn correlation_signs(table: &Table, target: &str) -> Vec<CorrelationCheck> {
    let Some(target_idx) = table.column_index(target) else {
        return Vec::new();
    };
    EXPECTED_SIGNS
        .iter()
        .filter_map(|(covariate, expected)| {
            let idx = table.column_index(covariate)?;
            let pairs: Vec<(f64, f64)> = table
                .rows()
                .iter()
                .filter_map(|r| Some((r[target_idx].as_f64()?, r[idx].as_f64()?)))
                .collect();
            let coefficient = pearson(&pairs)?;
            let unexpected = match expected {
                Sign::Positive => coefficient < 0.0,
                Sign::Negative => coefficient > 0.0,
            };
            if unexpected {
                warn!(
                    column = target,
                    covariate = *covariate,
                    coefficient,
                    "correlation sign differs from expectation"
                );
            }
            Some(CorrelationCheck {
                covariate: covariate.to_string(),
                expected: *expected,
                coefficient,
                pairs: pairs.len(),
                unexpected,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // BOUNDS
    // -------------------------------------------------------------------------

    #[test]
    fn test_clamp_reports_count() {
        let t = Table::from_rows(
            &["CO_MUNICIPIO", "TAXA_ABANDONO", "PNAD_TAXA_OCUPACAO", "NU_IDADE"],
            vec![
                vec![Value::Int(1), Value::Float(120.0), Value::Float(50.0), Value::Int(150)],
                vec![Value::Int(2), Value::Float(-3.0), Value::Float(101.0), Value::Int(16)],
                vec![Value::Int(3), Value::Float(40.0), Value::Null, Value::Null],
            ],
        );
        let (t, reports) = clamp_rates(t);
        assert_eq!(t.get(0, "TAXA_ABANDONO"), Some(&Value::Float(100.0)));
        assert_eq!(t.get(1, "TAXA_ABANDONO"), Some(&Value::Float(0.0)));
        assert_eq!(t.get(2, "TAXA_ABANDONO"), Some(&Value::Float(40.0)));
        // Not a rate column.
        assert_eq!(t.get(0, "NU_IDADE"), Some(&Value::Int(150)));
        assert_eq!(
            reports,
            vec![
                ClampReport {
                    column: "TAXA_ABANDONO".into(),
                    clamped_rows: 2
                },
                ClampReport {
                    column: "PNAD_TAXA_OCUPACAO".into(),
                    clamped_rows: 1
                },
            ]
        );
    }

    #[test]
    fn test_rates_bounded_after_check() {
        let t = Table::from_rows(
            &["TAXA_ABANDONO"],
            vec![vec![Value::Float(250.0)], vec![Value::Int(-1)], vec![Value::Float(12.5)]],
        );
        let (t, diagnostics) = check(t, &CheckOptions::default());
        for v in t.column_values("TAXA_ABANDONO").unwrap() {
            let x = v.as_f64().unwrap();
            assert!((RATE_MIN..=RATE_MAX).contains(&x));
        }
        assert_eq!(diagnostics.total_clamped(), 2);
        assert_eq!(diagnostics.warnings.len(), 1);
    }

    #[test]
    fn test_bounds_check_can_be_disabled() {
        let t = Table::from_rows(&["TAXA_ABANDONO"], vec![vec![Value::Float(250.0)]]);
        let options = CheckOptions {
            bounds: false,
            ..CheckOptions::default()
        };
        let (t, diagnostics) = check(t, &options);
        assert_eq!(t.get(0, "TAXA_ABANDONO"), Some(&Value::Float(250.0)));
        assert!(diagnostics.clamped.is_empty());
    }

    // -------------------------------------------------------------------------
    // MISSING VALUES
    // -------------------------------------------------------------------------

    fn with_gaps() -> Table {
        Table::from_rows(
            &["IDEB", "REGIAO"],
            vec![
                vec![Value::Float(4.0), Value::from("Sul")],
                vec![Value::Null, Value::Null],
                vec![Value::Float(6.0), Value::from("Norte")],
                vec![Value::Null, Value::from("Sul")],
            ],
        )
    }

    #[test]
    fn test_missing_report() {
        let report = missing_values(&with_gaps());
        assert_eq!(report[0].column, "IDEB");
        assert_eq!(report[0].nulls, 2);
        assert_eq!(report[0].percent, 50.0);
        assert_eq!(report[1].nulls, 1);
        assert_eq!(report[1].percent, 25.0);
    }

    #[test]
    fn test_check_never_imputes() {
        let (t, diagnostics) = check(with_gaps(), &CheckOptions::default());
        assert_eq!(t, with_gaps());
        assert!(diagnostics.imputed.is_empty());
    }

    #[test]
    fn test_impute_missing() {
        let (t, reports) = impute_missing(with_gaps());
        assert_eq!(t.get(1, "IDEB"), Some(&Value::Float(5.0)));
        assert_eq!(t.get(3, "IDEB"), Some(&Value::Float(5.0)));
        assert_eq!(t.get(1, "REGIAO"), Some(&Value::from(UNKNOWN_LABEL)));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].filled, 2);
    }

    // -------------------------------------------------------------------------
    // CORRELATIONS
    // -------------------------------------------------------------------------

    #[test]
    fn test_pearson() {
        let r = pearson(&[(1.0, 2.0), (2.0, 4.0), (3.0, 6.0)]).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
        assert_eq!(pearson(&[(1.0, 2.0), (2.0, 4.0)]), None);
        assert_eq!(pearson(&[(1.0, 2.0), (1.0, 4.0), (1.0, 6.0)]), None);
    }

    #[test]
    fn test_unexpected_sign_is_warning() {
        // Dropout falls as poverty rises: against expectation.
        let t = Table::from_rows(
            &["TAXA_ABANDONO", "TAXA_POBREZA", "IDEB"],
            vec![
                vec![Value::Float(20.0), Value::Float(10.0), Value::Float(3.0)],
                vec![Value::Float(10.0), Value::Float(20.0), Value::Float(4.0)],
                vec![Value::Float(5.0), Value::Float(30.0), Value::Float(5.0)],
                vec![Value::Null, Value::Float(40.0), Value::Float(6.0)],
            ],
        );
        let (_, diagnostics) = check(t, &CheckOptions::default());
        assert_eq!(diagnostics.correlations.len(), 2);
        let poverty = &diagnostics.correlations[0];
        assert_eq!(poverty.covariate, "TAXA_POBREZA");
        assert_eq!(poverty.pairs, 3);
        assert!(poverty.unexpected);
        let ideb = &diagnostics.correlations[1];
        assert!(!ideb.unexpected);
        assert_eq!(diagnostics.warnings.len(), 1);
    }

    #[test]
    fn test_correlation_without_target_column() {
        let t = Table::from_rows(&["IDEB"], vec![vec![Value::Float(1.0)]]);
        assert!(correlation_signs(&t, "TAXA_ABANDONO").is_empty());
    }
}
