//! Run configuration.
//!
//! Values come from the environment (optionally a `.env` file) and are then
//! overridden by command-line flags in the binary. The resulting
//! `PipelineConfig` is passed explicitly to every component.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

/// Aggregation level of an integrated dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    School,
    Municipality,
    Student,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::School, Level::Municipality, Level::Student];

    /// Plural label used in output file names.
    pub fn file_label(self) -> &'static str {
        match self {
            Level::School => "escolas",
            Level::Municipality => "municipios",
            Level::Student => "alunos",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::School => "school",
            Level::Municipality => "municipality",
            Level::Student => "student",
        })
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "school" | "escola" => Ok(Level::School),
            "municipality" | "municipio" => Ok(Level::Municipality),
            "student" | "aluno" => Ok(Level::Student),
            other => Err(format!("unknown level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub year: i32,
    pub levels: Vec<Level>,
    pub include_indicators: bool,
    pub include_survey: bool,
    /// Deduplicate secondary tables first-wins instead of rejecting them.
    pub dedup_secondary: bool,
    pub impute_missing: bool,
    pub raw_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Optional JSON code-mapping resource replacing the built-in one.
    pub mapping_path: Option<PathBuf>,
}

impl PipelineConfig {
    /// Defaults for `year`, read directories from the environment.
    pub fn from_env(year: i32) -> Self {
        Self {
            year,
            levels: Level::ALL.to_vec(),
            include_indicators: true,
            include_survey: true,
            dedup_secondary: false,
            impute_missing: false,
            raw_dir: PathBuf::from(
                std::env::var("RAW_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
            output_dir: PathBuf::from(
                std::env::var("PROCESSED_DIR").unwrap_or_else(|_| "./data/processed".to_string()),
            ),
            mapping_path: std::env::var("CODE_MAPPINGS").ok().map(PathBuf::from),
        }
    }

    /// Configuration rooted at explicit directories, all sources enabled.
    pub fn new(year: i32, raw_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            year,
            levels: Level::ALL.to_vec(),
            include_indicators: true,
            include_survey: true,
            dedup_secondary: false,
            impute_missing: false,
            raw_dir: raw_dir.into(),
            output_dir: output_dir.into(),
            mapping_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_str_accepts_both_vocabularies() {
        assert_eq!("school".parse::<Level>().unwrap(), Level::School);
        assert_eq!("Municipio".parse::<Level>().unwrap(), Level::Municipality);
        assert_eq!("aluno".parse::<Level>().unwrap(), Level::Student);
        assert!("state".parse::<Level>().is_err());
    }

    #[test]
    fn test_new_enables_all_sources() {
        let cfg = PipelineConfig::new(2021, "raw", "out");
        assert!(cfg.include_indicators);
        assert!(cfg.include_survey);
        assert!(!cfg.dedup_secondary);
        assert_eq!(cfg.levels.len(), 3);
    }
}
