//! Source catalog: resolves (source, year) to a local file.
//!
//! Downloading and extracting archives happens elsewhere; by the time the
//! integrator runs, every available source is a file on disk. A catalog only
//! answers "where is it" or "it is not there".

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Educational indicator tables, in the fixed order they are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Rendimento,
    Distorcao,
    Docente,
    Complexidade,
    Inse,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 5] = [
        IndicatorKind::Rendimento,
        IndicatorKind::Distorcao,
        IndicatorKind::Docente,
        IndicatorKind::Complexidade,
        IndicatorKind::Inse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IndicatorKind::Rendimento => "rendimento",
            IndicatorKind::Distorcao => "distorcao",
            IndicatorKind::Docente => "docente",
            IndicatorKind::Complexidade => "complexidade",
            IndicatorKind::Inse => "inse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// School census enrollment microdata, one row per enrollment.
    CensusEnrollment,
    /// School census school table, one row per school.
    CensusSchool,
    /// Assessment results aggregated per school.
    AssessmentSchool,
    /// Assessment results per student.
    AssessmentStudent,
    Indicator(IndicatorKind),
    /// Municipal socioeconomic table, not tied to a year.
    Socioeconomic,
    /// Household survey microdata.
    Survey,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::CensusEnrollment => f.write_str("census_enrollment"),
            SourceKind::CensusSchool => f.write_str("census_school"),
            SourceKind::AssessmentSchool => f.write_str("assessment_school"),
            SourceKind::AssessmentStudent => f.write_str("assessment_student"),
            SourceKind::Indicator(kind) => write!(f, "indicator_{}", kind.as_str()),
            SourceKind::Socioeconomic => f.write_str("socioeconomic"),
            SourceKind::Survey => f.write_str("survey"),
        }
    }
}

impl SourceKind {
    /// Parse the manifest spelling; `kind` is only used by indicators.
    pub fn parse(source: &str, kind: Option<IndicatorKind>) -> Option<SourceKind> {
        match (source, kind) {
            ("census_enrollment", _) => Some(SourceKind::CensusEnrollment),
            ("census_school", _) => Some(SourceKind::CensusSchool),
            ("assessment_school", _) => Some(SourceKind::AssessmentSchool),
            ("assessment_student", _) => Some(SourceKind::AssessmentStudent),
            ("indicator", Some(kind)) => Some(SourceKind::Indicator(kind)),
            ("socioeconomic", _) => Some(SourceKind::Socioeconomic),
            ("survey", _) => Some(SourceKind::Survey),
            _ => None,
        }
    }
}

/// The assessment is applied in odd years; an even reference year uses the
/// previous edition.
pub fn assessment_year(year: i32) -> i32 {
    if year.rem_euclid(2) == 1 {
        year
    } else {
        year - 1
    }
}

pub trait SourceCatalog: Send + Sync {
    /// Local path of `source` for `year`, or `SourceError::NotFound`.
    fn locate(&self, source: SourceKind, year: i32) -> Result<PathBuf, SourceError>;
}

/// Files laid out by naming convention in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Candidate file names, most preferred first.
    fn candidates(source: SourceKind, year: i32) -> Vec<String> {
        match source {
            SourceKind::CensusEnrollment => vec![format!("censo_escolar_{}_matricula.csv", year)],
            SourceKind::CensusSchool => vec![format!("censo_escolar_{}_escolas.csv", year)],
            SourceKind::AssessmentSchool => vec![format!("saeb_{}_escola.csv", year)],
            SourceKind::AssessmentStudent => vec![format!("saeb_{}_aluno.csv", year)],
            SourceKind::Indicator(kind) => vec![
                format!("indicadores_{}_{}.csv", kind.as_str(), year),
                format!("indicadores_{}_{}.xlsx", kind.as_str(), year),
            ],
            SourceKind::Socioeconomic => vec!["dados_socioeconomicos_municipios.csv".to_string()],
            SourceKind::Survey => vec![format!("pnad_{}_educacao.csv", year)],
        }
    }
}

impl SourceCatalog for DirectoryCatalog {
    fn locate(&self, source: SourceKind, year: i32) -> Result<PathBuf, SourceError> {
        let candidates = Self::candidates(source, year);
        for name in &candidates {
            let path = self.root.join(name);
            if path.is_file() {
                return Ok(path);
            }
        }
        Err(SourceError::NotFound {
            kind: source,
            year,
            path: self.root.join(&candidates[0]),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawManifestEntry {
    source: String,
    #[serde(default)]
    kind: Option<IndicatorKind>,
    #[serde(default)]
    year: Option<i32>,
    path: PathBuf,
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    source: SourceKind,
    /// Absent for sources that are not tied to a year.
    year: Option<i32>,
    path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    #[serde(default)]
    version: String,
    entries: Vec<RawManifestEntry>,
}

/// Explicit (source, year) → path list read from JSON.
///
/// ```json
/// { "version": "1",
///   "entries": [
///     { "source": "census_enrollment", "year": 2021, "path": "matricula.csv" },
///     { "source": "indicator", "kind": "inse", "year": 2021, "path": "inse.xlsx" }
///   ] }
/// ```
///
/// Relative paths are resolved against the manifest's directory.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    version: String,
    entries: Vec<ManifestEntry>,
}

impl ManifestCatalog {
    pub fn from_json(content: &str, base: &Path) -> anyhow::Result<Self> {
        let manifest: Manifest = serde_json::from_str(content)?;
        let mut entries = Vec::with_capacity(manifest.entries.len());
        for raw in manifest.entries {
            let source = SourceKind::parse(&raw.source, raw.kind).ok_or_else(|| {
                anyhow::anyhow!("unknown manifest source '{}' (kind {:?})", raw.source, raw.kind)
            })?;
            let path = if raw.path.is_relative() {
                base.join(&raw.path)
            } else {
                raw.path
            };
            entries.push(ManifestEntry {
                source,
                year: raw.year,
                path,
            });
        }
        Ok(Self {
            version: manifest.version,
            entries,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl SourceCatalog for ManifestCatalog {
    fn locate(&self, source: SourceKind, year: i32) -> Result<PathBuf, SourceError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.source == source && e.year.map_or(true, |y| y == year));
        match entry {
            Some(e) if e.path.is_file() => Ok(e.path.clone()),
            Some(e) => Err(SourceError::NotFound {
                kind: source,
                year,
                path: e.path.clone(),
            }),
            None => Err(SourceError::NotFound {
                kind: source,
                year,
                path: PathBuf::from(format!("<no manifest entry for {}>", source)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_assessment_year_parity() {
        assert_eq!(assessment_year(2021), 2021);
        assert_eq!(assessment_year(2022), 2021);
        assert_eq!(assessment_year(2019), 2019);
        assert_eq!(assessment_year(2020), 2019);
    }

    #[test]
    fn test_source_kind_display() {
        assert_eq!(SourceKind::CensusEnrollment.to_string(), "census_enrollment");
        assert_eq!(
            SourceKind::Indicator(IndicatorKind::Inse).to_string(),
            "indicator_inse"
        );
    }

    #[test]
    fn test_directory_catalog_locates_by_convention() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("censo_escolar_2021_matricula.csv"), "A\n1\n").unwrap();
        let catalog = DirectoryCatalog::new(dir.path());

        let found = catalog.locate(SourceKind::CensusEnrollment, 2021).unwrap();
        assert!(found.ends_with("censo_escolar_2021_matricula.csv"));

        let missing = catalog.locate(SourceKind::CensusEnrollment, 2020).unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_directory_catalog_indicator_spreadsheet_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("indicadores_inse_2021.xlsx"), b"").unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        let found = catalog
            .locate(SourceKind::Indicator(IndicatorKind::Inse), 2021)
            .unwrap();
        assert!(found.ends_with("indicadores_inse_2021.xlsx"));
    }

    #[test]
    fn test_directory_catalog_socioeconomic_ignores_year() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dados_socioeconomicos_municipios.csv"), "A\n").unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        assert!(catalog.locate(SourceKind::Socioeconomic, 2019).is_ok());
        assert!(catalog.locate(SourceKind::Socioeconomic, 2023).is_ok());
    }

    #[test]
    fn test_manifest_rejects_unknown_source() {
        let json = r#"{ "entries": [ { "source": "rais", "path": "x.csv" } ] }"#;
        assert!(ManifestCatalog::from_json(json, Path::new(".")).is_err());
        let json = r#"{ "entries": [ { "source": "indicator", "path": "x.csv" } ] }"#;
        assert!(ManifestCatalog::from_json(json, Path::new(".")).is_err());
    }

    #[test]
    fn test_manifest_catalog() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mat.csv"), "A\n1\n").unwrap();
        let json = r#"{
            "version": "1",
            "entries": [
                { "source": "census_enrollment", "year": 2021, "path": "mat.csv" },
                { "source": "indicator", "kind": "inse", "year": 2021, "path": "inse.csv" }
            ]
        }"#;
        let catalog = ManifestCatalog::from_json(json, dir.path()).unwrap();
        assert_eq!(catalog.version(), "1");

        assert!(catalog.locate(SourceKind::CensusEnrollment, 2021).is_ok());
        assert!(catalog
            .locate(SourceKind::CensusEnrollment, 2022)
            .unwrap_err()
            .is_not_found());
        // Listed but absent on disk.
        assert!(catalog
            .locate(SourceKind::Indicator(IndicatorKind::Inse), 2021)
            .unwrap_err()
            .is_not_found());
    }
}
