//! Integrator - one integrated dataset per level and year
//!
//! Responsibilities:
//! - Build the level's primary table (load, normalize, derive, aggregate)
//! - Left-join secondary sources in a fixed order: primary extras,
//!   assessment, indicators, survey
//! - Skip a missing, unreadable or ambiguous secondary and record why
//! - Fail the level when the primary table cannot be built
//! - Verify the primary row count after every join
//! - Run the consistency checks on the result
//!
//! Socioeconomic and survey data are only ever read from files; nothing is
//! synthesized when they are absent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregate::{aggregate, AggregateSpec, DROPOUT_RATE};
use crate::catalog::{assessment_year, IndicatorKind, SourceCatalog, SourceKind};
use crate::checker::{self, CheckOptions, Diagnostics};
use crate::config::{Level, PipelineConfig};
use crate::derive;
use crate::error::{IntegrationError, Result, SourceError};
use crate::join::{left_join, DedupPolicy, JoinSpec, JoinSummary};
use crate::loader::{self, LoadSpec, LoadedSource, Provenance, RowFilter};
use crate::normalize::{normalize, MappingSet};
use crate::table::{Key, Table};

/// Enrollment fields used by any level.
pub const ENROLLMENT_COLUMNS: &[&str] = &[
    "NU_ANO_CENSO",
    "CO_UF",
    "CO_MUNICIPIO",
    "CO_ENTIDADE",
    "CO_PESSOA_FISICA",
    "ID_ALUNO",
    "TP_DEPENDENCIA",
    "TP_LOCALIZACAO",
    "TP_SEXO",
    "TP_COR_RACA",
    "NU_IDADE",
    "TP_ETAPA_ENSINO",
    "IN_TRANSPORTE_PUBLICO",
    "TP_SITUACAO",
];

/// School census fields joined at school level.
pub const SCHOOL_COLUMNS: &[&str] = &[
    "CO_ENTIDADE",
    "NO_ENTIDADE",
    "CO_MUNICIPIO",
    "CO_UF",
    "TP_DEPENDENCIA",
    "TP_LOCALIZACAO",
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

/// Stable student identifiers, most preferred first.
pub const STUDENT_ID_COLUMNS: &[&str] = &["CO_PESSOA_FISICA", "ID_ALUNO"];

const SCHOOL_KEY: &str = "CO_ENTIDADE";
const MUNICIPALITY_KEY: &str = "CO_MUNICIPIO";
const STATE_KEY: &str = "CO_UF";
/// School key spelling of the assessment tables.
const ASSESSMENT_SCHOOL_KEY: &str = "ID_ESCOLA";
/// State key spelling of the household survey.
const SURVEY_STATE_KEY: &str = "UF";
const SURVEY_PREFIX: &str = "PNAD_";
const PROFICIENCY_MARKER: &str = "PROFICIENCIA";

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSource {
    pub source: String,
    pub year: i32,
    pub reason: String,
}

/// Everything the Integrator learned while building one level.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationReport {
    pub level: Level,
    pub year: i32,
    pub mapping_version: String,
    pub primary_rows: usize,
    /// Records dropped from aggregation because their key was null.
    pub null_keys: usize,
    /// Enrollment records replaced by a later record of the same student.
    pub superseded_enrollments: usize,
    pub provenance: Vec<Provenance>,
    pub joins: Vec<JoinSummary>,
    pub skipped: Vec<SkippedSource>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct IntegratedDataset {
    pub level: Level,
    pub year: i32,
    pub table: Table,
    pub report: IntegrationReport,
}

/// Keep the last enrollment of each student when a stable identifier column
/// exists. Rows without an identifier are kept. Returns the number of rows
/// removed.
pub fn last_enrollment_wins(mut table: Table) -> (Table, usize) {
    let Some(idx) = STUDENT_ID_COLUMNS
        .iter()
        .find_map(|c| table.column_index(c))
    else {
        return (table, 0);
    };

    let mut last: BTreeMap<Key, usize> = BTreeMap::new();
    for (i, row) in table.rows().iter().enumerate() {
        if let Some(key) = Key::from_value(&row[idx]) {
            last.insert(key, i);
        }
    }
    let keep: BTreeSet<usize> = last.into_values().collect();

    let before = table.len();
    let mut position = 0;
    table.retain_rows(|_, row| {
        let current = position;
        position += 1;
        row[idx].is_null() || keep.contains(&current)
    });
    let removed = before - table.len();
    (table, removed)
}

/// The assessment tables call the school key `ID_ESCOLA`.
fn with_school_key(mut table: Table) -> Table {
    if !table.has_column(SCHOOL_KEY) {
        table.rename_column(ASSESSMENT_SCHOOL_KEY, SCHOOL_KEY);
    }
    table
}

#[derive(Clone)]
pub struct Integrator {
    catalog: Arc<dyn SourceCatalog>,
    mappings: Arc<MappingSet>,
    config: PipelineConfig,
}

impl Integrator {
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        mappings: Arc<MappingSet>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            catalog,
            mappings,
            config,
        }
    }

    fn dedup_policy(&self) -> DedupPolicy {
        if self.config.dedup_secondary {
            DedupPolicy::FirstWins
        } else {
            DedupPolicy::Reject
        }
    }

    /// Build the integrated dataset of `level` for the configured year.
    pub fn integrate(&self, level: Level) -> Result<IntegratedDataset> {
        let year = self.config.year;
        info!(level = %level, year, "integration started");

        let mut run = Run {
            integrator: self,
            level,
            year,
            report: IntegrationReport {
                level,
                year,
                mapping_version: self.mappings.version.clone(),
                primary_rows: 0,
                null_keys: 0,
                superseded_enrollments: 0,
                provenance: Vec::new(),
                joins: Vec::new(),
                skipped: Vec::new(),
                diagnostics: Diagnostics::default(),
            },
        };

        let table = match level {
            Level::School => run.school()?,
            Level::Municipality => run.municipality()?,
            Level::Student => run.student()?,
        };

        let (table, mut diagnostics) = checker::enforce_bounds(table);
        let table = run.from_rates(table);
        checker::inspect(&table, &CheckOptions::default(), &mut diagnostics);
        let table = if self.config.impute_missing {
            let (table, imputed) = checker::impute_missing(table);
            diagnostics.imputed = imputed;
            table
        } else {
            table
        };
        for warning in &diagnostics.warnings {
            warn!(level = %level, year, "{}", warning);
        }

        let mut report = run.report;
        report.diagnostics = diagnostics;
        info!(
            level = %level,
            year,
            rows = table.len(),
            columns = table.width(),
            joins = report.joins.len(),
            skipped = report.skipped.len(),
            clamped = report.diagnostics.total_clamped(),
            "integration finished"
        );
        Ok(IntegratedDataset {
            level,
            year,
            table,
            report,
        })
    }
}

/// State of one level's integration.
struct Run<'a> {
    integrator: &'a Integrator,
    level: Level,
    year: i32,
    report: IntegrationReport,
}

impl Run<'_> {
    fn locate_and_load(
        &self,
        kind: SourceKind,
        year: i32,
        spec: &LoadSpec<'_>,
    ) -> std::result::Result<LoadedSource, SourceError> {
        let path = self.integrator.catalog.locate(kind, year)?;
        loader::load(&path, kind, year, spec)
    }

    fn primary(&mut self, kind: SourceKind, spec: &LoadSpec<'_>) -> Result<Table> {
        match self.locate_and_load(kind, self.year, spec) {
            Ok(loaded) => {
                self.report.provenance.push(loaded.provenance);
                Ok(loaded.table)
            }
            Err(cause) => {
                error!(level = %self.level, year = self.year, source = %kind, error = %cause, "primary source unavailable");
                Err(IntegrationError::PrimaryUnavailable {
                    level: self.level,
                    year: self.year,
                    kind,
                    cause,
                })
            }
        }
    }

    fn secondary(&mut self, kind: SourceKind, year: i32, spec: &LoadSpec<'_>) -> Option<Table> {
        match self.locate_and_load(kind, year, spec) {
            Ok(loaded) => {
                self.report.provenance.push(loaded.provenance);
                Some(loaded.table)
            }
            Err(e) => {
                self.skip(kind, year, e.to_string());
                None
            }
        }
    }

    fn skip(&mut self, kind: SourceKind, year: i32, reason: String) {
        warn!(level = %self.level, year, source = %kind, reason = %reason, "secondary source skipped");
        self.report.skipped.push(SkippedSource {
            source: kind.to_string(),
            year,
            reason,
        });
    }

    fn invalid(&self, reason: impl Into<String>) -> IntegrationError {
        IntegrationError::PrimaryInvalid {
            level: self.level,
            year: self.year,
            reason: reason.into(),
        }
    }

    /// Join `right` onto `table`; a join that cannot be done safely is
    /// skipped and `table` comes back unchanged.
    fn join(
        &mut self,
        table: Table,
        right: &Table,
        kind: SourceKind,
        year: i32,
        key: &str,
        right_key: &str,
    ) -> Result<Table> {
        let dataset = kind.to_string();
        let spec = JoinSpec::on(&dataset, key)
            .right_key(right_key)
            .dedup(self.integrator.dedup_policy());
        match left_join(&table, right, &spec) {
            Ok((joined, summary)) => {
                if joined.len() != table.len() {
                    return Err(IntegrationError::RowCountChanged {
                        dataset,
                        before: table.len(),
                        after: joined.len(),
                    });
                }
                info!(
                    level = %self.level,
                    year,
                    source = %kind,
                    added = summary.added_columns.len(),
                    matched = summary.matched_rows,
                    "secondary source joined"
                );
                self.report.joins.push(summary);
                Ok(joined)
            }
            Err(e) => {
                self.skip(kind, year, e.to_string());
                Ok(table)
            }
        }
    }

    fn aggregate(&mut self, records: &Table, spec: &AggregateSpec) -> Result<Table> {
        let aggregated = aggregate(records, spec).map_err(|e| self.invalid(e.to_string()))?;
        if aggregated.null_keys > 0 {
            warn!(
                level = %self.level,
                year = self.year,
                key = %spec.key,
                null_keys = aggregated.null_keys,
                "records without key excluded from aggregation"
            );
        }
        self.report.null_keys += aggregated.null_keys;
        Ok(aggregated.table)
    }

    /// Secondary-education enrollment records, filtered on load.
    fn enrollments(&mut self) -> Result<Table> {
        let spec = LoadSpec::columns(ENROLLMENT_COLUMNS).with_filter(RowFilter::secondary_education());
        let table = self.primary(SourceKind::CensusEnrollment, &spec)?;
        if table.is_empty() {
            return Err(self.invalid("no secondary-education enrollment records"));
        }
        Ok(table)
    }

    fn normalized(&self, table: &Table) -> Table {
        normalize(table, &self.integrator.mappings)
    }

    // =========================================================================
    // LEVELS
    // =========================================================================

    fn school(&mut self) -> Result<Table> {
        let enrollments = self.enrollments()?;
        let records = derive::with_student_indicators(self.normalized(&enrollments));
        let mut table = self.aggregate(&records, &AggregateSpec::school())?;
        self.report.primary_rows = table.len();

        let schools_spec = LoadSpec::columns(SCHOOL_COLUMNS);
        if let Some(schools) = self.secondary(SourceKind::CensusSchool, self.year, &schools_spec) {
            let schools = derive::with_infrastructure_index(self.normalized(&schools));
            table = self.join(table, &schools, SourceKind::CensusSchool, self.year, SCHOOL_KEY, SCHOOL_KEY)?;
        }

        let saeb_year = assessment_year(self.year);
        if let Some(saeb) = self.secondary(SourceKind::AssessmentSchool, saeb_year, &LoadSpec::all()) {
            let saeb = with_school_key(saeb);
            table = self.join(table, &saeb, SourceKind::AssessmentSchool, saeb_year, SCHOOL_KEY, SCHOOL_KEY)?;
        }

        if self.integrator.config.include_indicators {
            table = self.indicators(table, SCHOOL_KEY)?;
        }
        if self.integrator.config.include_survey {
            table = self.survey(table)?;
        }
        Ok(table)
    }

    fn municipality(&mut self) -> Result<Table> {
        let enrollments = self.enrollments()?;
        let records = derive::with_student_indicators(self.normalized(&enrollments));
        let mut table = self.aggregate(&records, &AggregateSpec::municipality())?;
        self.report.primary_rows = table.len();

        if self.integrator.config.include_indicators {
            if let Some(socio) = self.secondary(SourceKind::Socioeconomic, self.year, &LoadSpec::all()) {
                table = self.join(table, &socio, SourceKind::Socioeconomic, self.year, MUNICIPALITY_KEY, MUNICIPALITY_KEY)?;
            }
            table = self.indicators(table, MUNICIPALITY_KEY)?;
        }
        if self.integrator.config.include_survey {
            table = self.survey(table)?;
        }

        Ok(derive::with_region(table))
    }

    /// Columns computed from rates; runs after the bounds pass so every
    /// derived value agrees with the rates left in its row.
    fn from_rates(&self, table: Table) -> Table {
        match self.level {
            Level::School => derive::with_dropout_category(table, DROPOUT_RATE),
            Level::Municipality => {
                let table = derive::with_vulnerability_index(table);
                derive::with_dropout_category(table, DROPOUT_RATE)
            }
            Level::Student => table,
        }
    }

    fn student(&mut self) -> Result<Table> {
        let (enrollments, superseded) = last_enrollment_wins(self.enrollments()?);
        if superseded > 0 {
            info!(level = %self.level, year = self.year, superseded, "earlier enrollments of transferred students dropped");
        }
        self.report.superseded_enrollments = superseded;
        let mut table = derive::with_student_indicators(self.normalized(&enrollments));
        self.report.primary_rows = table.len();

        let saeb_year = assessment_year(self.year);
        if let Some(saeb) = self.secondary(SourceKind::AssessmentStudent, saeb_year, &LoadSpec::all()) {
            let saeb = with_school_key(saeb);
            let spec = AggregateSpec::numeric_means(&saeb, SCHOOL_KEY, "", |c| {
                c.to_uppercase().contains(PROFICIENCY_MARKER)
            });
            if spec.fields.is_empty() {
                self.skip(SourceKind::AssessmentStudent, saeb_year, "no proficiency columns".to_string());
            } else {
                match aggregate(&saeb, &spec) {
                    Ok(by_school) => {
                        table = self.join(table, &by_school.table, SourceKind::AssessmentStudent, saeb_year, SCHOOL_KEY, SCHOOL_KEY)?;
                    }
                    Err(e) => self.skip(SourceKind::AssessmentStudent, saeb_year, e.to_string()),
                }
            }
        }
        Ok(table)
    }

    // =========================================================================
    // SHARED SECONDARIES
    // =========================================================================

    fn indicators(&mut self, mut table: Table, key: &str) -> Result<Table> {
        for kind in IndicatorKind::ALL {
            let source = SourceKind::Indicator(kind);
            if let Some(indicator) = self.secondary(source, self.year, &LoadSpec::all()) {
                table = self.join(table, &indicator, source, self.year, key, key)?;
            }
        }
        Ok(table)
    }

    /// Household survey coarsened to state means and joined on the state key.
    fn survey(&mut self, table: Table) -> Result<Table> {
        let Some(survey) = self.secondary(SourceKind::Survey, self.year, &LoadSpec::all()) else {
            return Ok(table);
        };
        let spec = AggregateSpec::numeric_means(&survey, SURVEY_STATE_KEY, SURVEY_PREFIX, |_| true);
        if spec.fields.is_empty() {
            self.skip(SourceKind::Survey, self.year, "no numeric survey columns".to_string());
            return Ok(table);
        }
        match aggregate(&survey, &spec) {
            Ok(by_state) => self.join(table, &by_state.table, SourceKind::Survey, self.year, STATE_KEY, SURVEY_STATE_KEY),
            Err(e) => {
                self.skip(SourceKind::Survey, self.year, e.to_string());
                Ok(table)
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
