//! Code Normalizer - categorical codes to canonical labels
//!
//! Each mapped field has its own `code -> label` table. A code missing from
//! the table is left as it is, so codes introduced in newer data years pass
//! through instead of turning into nulls. Labels are never codes, which makes
//! normalization idempotent.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::table::{Table, Value};

/// Versioned `field -> (code -> label)` resource, loaded once and shared
/// read-only between levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSet {
    pub version: String,
    pub fields: BTreeMap<String, BTreeMap<i64, String>>,
}

/// Canonical label of the abandonment outcome.
pub const ABANDONMENT_LABEL: &str = "Abandono";
/// Year-end status code for abandonment.
pub const ABANDONMENT_CODE: i64 = 4;

fn table(entries: &[(i64, &str)]) -> BTreeMap<i64, String> {
    entries.iter().map(|(c, l)| (*c, l.to_string())).collect()
}

impl MappingSet {
    /// School census vocabulary.
    pub fn census() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "TP_DEPENDENCIA".to_string(),
            table(&[(1, "Federal"), (2, "Estadual"), (3, "Municipal"), (4, "Privada")]),
        );
        fields.insert(
            "TP_LOCALIZACAO".to_string(),
            table(&[(1, "Urbana"), (2, "Rural")]),
        );
        fields.insert(
            "TP_SEXO".to_string(),
            table(&[(1, "Masculino"), (2, "Feminino")]),
        );
        fields.insert(
            "TP_COR_RACA".to_string(),
            table(&[
                (0, "Não declarada"),
                (1, "Branca"),
                (2, "Preta"),
                (3, "Parda"),
                (4, "Amarela"),
                (5, "Indígena"),
            ]),
        );
        fields.insert(
            "TP_SITUACAO".to_string(),
            table(&[
                (1, "Aprovado"),
                (2, "Reprovado"),
                (3, "Transferido"),
                (ABANDONMENT_CODE, ABANDONMENT_LABEL),
            ]),
        );
        Self {
            version: "censo-escolar-1".to_string(),
            fields,
        }
    }

    /// Read a JSON resource of the same shape.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read code mappings {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse code mappings {}", path.display()))
    }

    /// Label for one cell, or `None` when the cell is not a mapped code.
    pub fn label(&self, field: &str, value: &Value) -> Option<&str> {
        let code = value.as_code().or_else(|| match value {
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        })?;
        self.fields.get(field)?.get(&code).map(String::as_str)
    }
}

/// Replace mapped codes by labels. Unmapped fields and unknown codes are
/// untouched; row order is preserved.
pub fn normalize(table: &Table, mappings: &MappingSet) -> Table {
    let mapped: Vec<(usize, &str)> = table
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| mappings.fields.contains_key(c.as_str()))
        .map(|(i, c)| (i, c.as_str()))
        .collect();

    let mut out = table.clone();
    if mapped.is_empty() {
        return out;
    }
    for row in out.rows_mut() {
        for &(idx, field) in &mapped {
            if let Some(label) = mappings.label(field, &row[idx]) {
                row[idx] = Value::Text(label.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn students() -> Table {
        Table::from_rows(
            &["CO_ENTIDADE", "TP_SEXO", "TP_SITUACAO", "TP_COR_RACA"],
            vec![
                vec![Value::Int(1), Value::Int(1), Value::Int(4), Value::Int(3)],
                vec![Value::Int(1), Value::Int(2), Value::Int(1), Value::Int(9)],
                vec![Value::Int(2), Value::Null, Value::from("4"), Value::Float(5.0)],
            ],
        )
    }

    #[test]
    fn test_normalize_maps_known_codes() {
        let out = normalize(&students(), &MappingSet::census());
        assert_eq!(out.get(0, "TP_SEXO"), Some(&Value::from("Masculino")));
        assert_eq!(out.get(0, "TP_SITUACAO"), Some(&Value::from("Abandono")));
        assert_eq!(out.get(0, "TP_COR_RACA"), Some(&Value::from("Parda")));
        assert_eq!(out.get(2, "TP_SITUACAO"), Some(&Value::from("Abandono")));
        assert_eq!(out.get(2, "TP_COR_RACA"), Some(&Value::from("Indígena")));
    }

    #[test]
    fn test_unknown_code_passes_through() {
        let out = normalize(&students(), &MappingSet::census());
        assert_eq!(out.get(1, "TP_COR_RACA"), Some(&Value::Int(9)));
        assert_eq!(out.get(2, "TP_SEXO"), Some(&Value::Null));
    }

    #[test]
    fn test_unmapped_fields_untouched() {
        let out = normalize(&students(), &MappingSet::census());
        let original = students();
        assert_eq!(
            out.column_values("CO_ENTIDADE").unwrap().collect::<Vec<_>>(),
            original.column_values("CO_ENTIDADE").unwrap().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        let mappings = MappingSet::census();
        let once = normalize(&students(), &mappings);
        let twice = normalize(&once, &mappings);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_mapping_json_round_shape() {
        let json = r#"{ "version": "custom-2", "fields": { "TP_LOCALIZACAO": { "1": "Urban", "2": "Rural" } } }"#;
        let set: MappingSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.version, "custom-2");
        assert_eq!(set.label("TP_LOCALIZACAO", &Value::Int(1)), Some("Urban"));
    }
}
