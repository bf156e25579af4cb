//! Indicator Derivator - per-record derived fields
//!
//! Every formula here is a pure function of fields already on the record.
//! Table-level helpers return a new table with the derived columns appended.

use crate::normalize::{ABANDONMENT_CODE, ABANDONMENT_LABEL};
use crate::table::{Table, Value};

pub const DROPOUT_FLAG: &str = "ABANDONO";
pub const EXPECTED_AGE: &str = "IDADE_ESPERADA";
pub const AGE_GRADE_DISTORTION: &str = "DISTORCAO_IDADE_SERIE";
pub const INFRASTRUCTURE_INDEX: &str = "INDICE_INFRAESTRUTURA";
pub const VULNERABILITY_INDEX: &str = "INDICE_VULNERABILIDADE";
pub const REGION: &str = "REGIAO";
pub const DROPOUT_CATEGORY: &str = "CATEGORIA_ABANDONO";

/// School facility indicators averaged into the infrastructure index.
pub const FACILITY_FIELDS: &[&str] = &[
    "IN_AGUA_FILTRADA",
    "IN_AGUA_REDE_PUBLICA",
    "IN_ENERGIA_REDE_PUBLICA",
    "IN_ESGOTO_REDE_PUBLICA",
    "IN_BIBLIOTECA",
    "IN_LABORATORIO_INFORMATICA",
    "IN_LABORATORIO_CIENCIAS",
    "IN_QUADRA_ESPORTES",
    "IN_SALA_ATENDIMENTO_ESPECIAL",
    "IN_INTERNET",
];

/// Expected age when the stage code is outside the known grade bands.
pub const DEFAULT_EXPECTED_AGE: i64 = 16;

const FIRST_GRADE_STAGES: &[i64] = &[25, 26, 30, 31, 35, 36];
const SECOND_GRADE_STAGES: &[i64] = &[27, 28, 32, 37];
const THIRD_GRADE_STAGES: &[i64] = &[29, 33, 38];

/// 1 when the year-end status is abandonment (raw code or canonical label).
pub fn dropout_flag(status: Option<&Value>) -> i64 {
    let abandoned = match status {
        Some(Value::Text(s)) => {
            s == ABANDONMENT_LABEL || s.trim().parse::<i64>().ok() == Some(ABANDONMENT_CODE)
        }
        Some(v) => v.as_code() == Some(ABANDONMENT_CODE),
        None => false,
    };
    i64::from(abandoned)
}

/// Expected age for a secondary-education stage code.
pub fn expected_age_for_grade(stage: Option<i64>) -> i64 {
    match stage {
        Some(s) if FIRST_GRADE_STAGES.contains(&s) => 15,
        Some(s) if SECOND_GRADE_STAGES.contains(&s) => 16,
        Some(s) if THIRD_GRADE_STAGES.contains(&s) => 17,
        _ => DEFAULT_EXPECTED_AGE,
    }
}

/// Years above the expected age; never negative.
pub fn age_grade_distortion(age: i64, expected: i64) -> i64 {
    (age - expected).max(0)
}

/// Mean of the non-null facility indicators; `None` when none is present.
pub fn infrastructure_index(facilities: &[&Value]) -> Option<f64> {
    let present: Vec<f64> = facilities.iter().filter_map(|v| v.as_f64()).collect();
    if present.is_empty() {
        return None;
    }
    Some(present.iter().sum::<f64>() / present.len() as f64)
}

/// `poverty/100 + unemployment/100 + gini - quality/10`, `None` if any term is
/// missing.
pub fn vulnerability_index(
    poverty_rate: Option<f64>,
    unemployment_rate: Option<f64>,
    gini_index: Option<f64>,
    education_quality_index: Option<f64>,
) -> Option<f64> {
    Some(
        poverty_rate? / 100.0 + unemployment_rate? / 100.0 + gini_index?
            - education_quality_index? / 10.0,
    )
}

/// Macro-region of a state code.
pub fn region_for_state(state_code: i64) -> Option<&'static str> {
    match state_code {
        11..=17 => Some("Norte"),
        21..=29 => Some("Nordeste"),
        31 | 32 | 33 | 35 => Some("Sudeste"),
        41..=43 => Some("Sul"),
        50..=53 => Some("Centro-Oeste"),
        _ => None,
    }
}

/// Band of a dropout rate in percent.
pub fn dropout_category(rate: f64) -> Option<&'static str> {
    match rate {
        r if !(0.0..=100.0).contains(&r) => None,
        r if r <= 5.0 => Some("Baixo (0-5%)"),
        r if r <= 10.0 => Some("Médio (5-10%)"),
        r if r <= 15.0 => Some("Alto (10-15%)"),
        _ => Some("Muito Alto (>15%)"),
    }
}

// =============================================================================
// TABLE-LEVEL DERIVATION
// =============================================================================

/// Append dropout flag, expected age and age-grade distortion to enrollment
/// records. Distortion is null when the age is missing.
pub fn with_student_indicators(table: Table) -> Table {
    let status = table.column_index("TP_SITUACAO");
    let stage = table.column_index("TP_ETAPA_ENSINO");
    let age = table.column_index("NU_IDADE");

    let mut flags = Vec::with_capacity(table.len());
    let mut expected = Vec::with_capacity(table.len());
    let mut distortion = Vec::with_capacity(table.len());
    for row in table.rows() {
        flags.push(Value::Int(dropout_flag(status.map(|i| &row[i]))));
        let exp = expected_age_for_grade(stage.and_then(|i| row[i].as_code()));
        expected.push(Value::Int(exp));
        distortion.push(
            age.and_then(|i| row[i].as_code())
                .map(|a| Value::Int(age_grade_distortion(a, exp)))
                .unwrap_or(Value::Null),
        );
    }

    let table = table.with_column(DROPOUT_FLAG, flags);
    if stage.is_none() || age.is_none() {
        return table;
    }
    table
        .with_column(EXPECTED_AGE, expected)
        .with_column(AGE_GRADE_DISTORTION, distortion)
}

/// Append the infrastructure index to school records. When the table has no
/// facility column at all the index is not added.
pub fn with_infrastructure_index(table: Table) -> Table {
    let idx: Vec<usize> = FACILITY_FIELDS
        .iter()
        .filter_map(|f| table.column_index(f))
        .collect();
    if idx.is_empty() {
        return table;
    }
    let values = table
        .rows()
        .iter()
        .map(|row| {
            let cells: Vec<&Value> = idx.iter().map(|&i| &row[i]).collect();
            Value::from(infrastructure_index(&cells))
        })
        .collect();
    table.with_column(INFRASTRUCTURE_INDEX, values)
}

fn numeric(table: &Table, row: usize, column: &str) -> Option<f64> {
    table.get(row, column).and_then(Value::as_f64)
}

/// Append the vulnerability index to municipality rows. Not added when any
/// input column is absent from the table.
pub fn with_vulnerability_index(table: Table) -> Table {
    const INPUTS: [&str; 4] = ["TAXA_POBREZA", "TAXA_DESEMPREGO", "INDICE_GINI", "IDEB"];
    if !INPUTS.iter().all(|c| table.has_column(c)) {
        return table;
    }
    let values = (0..table.len())
        .map(|r| {
            Value::from(vulnerability_index(
                numeric(&table, r, INPUTS[0]),
                numeric(&table, r, INPUTS[1]),
                numeric(&table, r, INPUTS[2]),
                numeric(&table, r, INPUTS[3]),
            ))
        })
        .collect();
    table.with_column(VULNERABILITY_INDEX, values)
}

/// Append the macro-region derived from `CO_UF`.
pub fn with_region(table: Table) -> Table {
    let Some(uf) = table.column_index("CO_UF") else {
        return table;
    };
    let values = table
        .rows()
        .iter()
        .map(|row| {
            row[uf]
                .as_code()
                .and_then(region_for_state)
                .map(Value::from)
                .unwrap_or(Value::Null)
        })
        .collect();
    table.with_column(REGION, values)
}

/// Append the dropout-rate band derived from `rate_column`.
pub fn with_dropout_category(table: Table, rate_column: &str) -> Table {
    let Some(rate) = table.column_index(rate_column) else {
        return table;
    };
    let values = table
        .rows()
        .iter()
        .map(|row| {
            row[rate]
                .as_f64()
                .and_then(dropout_category)
                .map(Value::from)
                .unwrap_or(Value::Null)
        })
        .collect();
    table.with_column(DROPOUT_CATEGORY, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // RECORD FORMULAS
    // -------------------------------------------------------------------------

    #[test]
    fn test_dropout_flag() {
        assert_eq!(dropout_flag(Some(&Value::Int(4))), 1);
        assert_eq!(dropout_flag(Some(&Value::from("Abandono"))), 1);
        assert_eq!(dropout_flag(Some(&Value::from("4"))), 1);
        assert_eq!(dropout_flag(Some(&Value::Int(1))), 0);
        assert_eq!(dropout_flag(Some(&Value::from("Aprovado"))), 0);
        assert_eq!(dropout_flag(Some(&Value::Null)), 0);
        assert_eq!(dropout_flag(None), 0);
    }

    #[test]
    fn test_expected_age_bands() {
        assert_eq!(expected_age_for_grade(Some(25)), 15);
        assert_eq!(expected_age_for_grade(Some(36)), 15);
        assert_eq!(expected_age_for_grade(Some(27)), 16);
        assert_eq!(expected_age_for_grade(Some(38)), 17);
        assert_eq!(expected_age_for_grade(Some(34)), DEFAULT_EXPECTED_AGE);
        assert_eq!(expected_age_for_grade(None), DEFAULT_EXPECTED_AGE);
    }

    #[test]
    fn test_distortion_never_negative() {
        assert_eq!(age_grade_distortion(14, 15), 0);
        assert_eq!(age_grade_distortion(15, 15), 0);
        assert_eq!(age_grade_distortion(19, 15), 4);
    }

    #[test]
    fn test_infrastructure_index_omitted_vs_zero() {
        assert_eq!(infrastructure_index(&[]), None);
        assert_eq!(infrastructure_index(&[&Value::Null, &Value::Null]), None);
        assert_eq!(infrastructure_index(&[&Value::Int(0), &Value::Int(0)]), Some(0.0));
        assert_eq!(
            infrastructure_index(&[&Value::Int(1), &Value::Null, &Value::Int(0)]),
            Some(0.5)
        );
    }

    #[test]
    fn test_vulnerability_index() {
        let v = vulnerability_index(Some(20.0), Some(10.0), Some(0.5), Some(5.0)).unwrap();
        assert!((v - 0.3).abs() < 1e-12);
        assert_eq!(vulnerability_index(None, Some(10.0), Some(0.5), Some(5.0)), None);
        assert_eq!(vulnerability_index(Some(20.0), Some(10.0), Some(0.5), None), None);
    }

    #[test]
    fn test_region_for_state() {
        assert_eq!(region_for_state(35), Some("Sudeste"));
        assert_eq!(region_for_state(29), Some("Nordeste"));
        assert_eq!(region_for_state(53), Some("Centro-Oeste"));
        assert_eq!(region_for_state(34), None);
    }

    #[test]
    fn test_dropout_category_bounds() {
        assert_eq!(dropout_category(0.0), Some("Baixo (0-5%)"));
        assert_eq!(dropout_category(5.0), Some("Baixo (0-5%)"));
        assert_eq!(dropout_category(5.1), Some("Médio (5-10%)"));
        assert_eq!(dropout_category(15.0), Some("Alto (10-15%)"));
        assert_eq!(dropout_category(100.0), Some("Muito Alto (>15%)"));
        assert_eq!(dropout_category(-1.0), None);
    }

    // -------------------------------------------------------------------------
    // TABLE DERIVATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_with_student_indicators() {
        let t = Table::from_rows(
            &["TP_SITUACAO", "TP_ETAPA_ENSINO", "NU_IDADE"],
            vec![
                vec![Value::from("Abandono"), Value::Int(25), Value::Int(18)],
                vec![Value::Int(1), Value::Int(29), Value::Int(16)],
                vec![Value::Null, Value::Int(34), Value::Null],
            ],
        );
        let t = with_student_indicators(t);
        assert_eq!(t.get(0, DROPOUT_FLAG), Some(&Value::Int(1)));
        assert_eq!(t.get(1, DROPOUT_FLAG), Some(&Value::Int(0)));
        assert_eq!(t.get(2, DROPOUT_FLAG), Some(&Value::Int(0)));
        assert_eq!(t.get(0, AGE_GRADE_DISTORTION), Some(&Value::Int(3)));
        assert_eq!(t.get(1, AGE_GRADE_DISTORTION), Some(&Value::Int(0)));
        assert_eq!(t.get(2, EXPECTED_AGE), Some(&Value::Int(16)));
        assert_eq!(t.get(2, AGE_GRADE_DISTORTION), Some(&Value::Null));
    }

    #[test]
    fn test_student_indicators_without_status_column() {
        let t = Table::from_rows(&["CO_ENTIDADE"], vec![vec![Value::Int(1)]]);
        let t = with_student_indicators(t);
        assert_eq!(t.get(0, DROPOUT_FLAG), Some(&Value::Int(0)));
        assert!(!t.has_column(AGE_GRADE_DISTORTION));
    }

    #[test]
    fn test_with_infrastructure_index_absent_columns() {
        let t = Table::from_rows(&["CO_ENTIDADE"], vec![vec![Value::Int(1)]]);
        let t = with_infrastructure_index(t);
        assert!(!t.has_column(INFRASTRUCTURE_INDEX));

        let t = Table::from_rows(
            &["CO_ENTIDADE", "IN_BIBLIOTECA", "IN_INTERNET"],
            vec![
                vec![Value::Int(1), Value::Int(0), Value::Int(0)],
                vec![Value::Int(2), Value::Int(1), Value::Int(0)],
            ],
        );
        let t = with_infrastructure_index(t);
        assert_eq!(t.get(0, INFRASTRUCTURE_INDEX), Some(&Value::Float(0.0)));
        assert_eq!(t.get(1, INFRASTRUCTURE_INDEX), Some(&Value::Float(0.5)));
    }

    #[test]
    fn test_with_vulnerability_index_requires_all_columns() {
        let t = Table::from_rows(&["TAXA_POBREZA"], vec![vec![Value::Float(10.0)]]);
        assert!(!with_vulnerability_index(t).has_column(VULNERABILITY_INDEX));

        let t = Table::from_rows(
            &["TAXA_POBREZA", "TAXA_DESEMPREGO", "INDICE_GINI", "IDEB"],
            vec![
                vec![Value::Float(20.0), Value::Float(10.0), Value::Float(0.5), Value::Float(5.0)],
                vec![Value::Null, Value::Float(10.0), Value::Float(0.5), Value::Float(5.0)],
            ],
        );
        let t = with_vulnerability_index(t);
        assert!(matches!(t.get(0, VULNERABILITY_INDEX), Some(Value::Float(_))));
        assert_eq!(t.get(1, VULNERABILITY_INDEX), Some(&Value::Null));
    }

    #[test]
    fn test_with_region() {
        let t = Table::from_rows(&["CO_UF"], vec![vec![Value::Int(43)], vec![Value::Int(99)]]);
        let t = with_region(t);
        assert_eq!(t.get(0, REGION), Some(&Value::from("Sul")));
        assert_eq!(t.get(1, REGION), Some(&Value::Null));
    }
}
