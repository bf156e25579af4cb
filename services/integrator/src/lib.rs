//! Education microdata integration engine
//!
//! Loads school census, assessment, indicator, socioeconomic and household
//! survey tables, harmonizes their codes and keys, and produces one
//! integrated dataset per level (school, municipality, student) and year.
//!
//! Pipeline per level:
//! loader -> normalize -> derive -> aggregate -> join -> checker -> output
//!
//! The library is synchronous and installs no global state; the binary owns
//! logging setup and concurrency.

pub mod aggregate;
pub mod catalog;
pub mod checker;
pub mod config;
pub mod derive;
pub mod error;
pub mod integrate;
pub mod join;
pub mod loader;
pub mod normalize;
pub mod output;
pub mod table;

pub use catalog::{DirectoryCatalog, ManifestCatalog, SourceCatalog, SourceKind};
pub use config::{Level, PipelineConfig};
pub use error::{IntegrationError, JoinError, SourceError};
pub use integrate::{IntegratedDataset, IntegrationReport, Integrator};
pub use normalize::MappingSet;
pub use table::{Key, Table, Value};
