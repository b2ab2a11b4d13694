#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Preferred-rank cleanup bot: pages through a SPARQL slice query and
//! demotes preferred statements that have no normal-rank sibling.

/// Defaults and optional TOML overrides.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Query service access.
#[path = "../query/main.rs"]
pub mod query;

/// Entity model and repository clients.
#[path = "../entity/main.rs"]
pub mod entity;

/// The rank rule.
#[path = "../normalizer.rs"]
pub mod normalizer;

/// Result rows to bare identifiers.
#[path = "../rows.rs"]
pub mod rows;

/// High-level orchestration entry point.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use config::{
    BotConfig, EditSettings, IdentifierSettings, LoggingSettings, QuerySettings,
    RepositorySettings,
};
pub use entity::{
    Claim, EntityEdit, EntityItem, EntityRepository, MemoryRepository, Rank, RepositoryError,
    WikibaseRepository,
};
pub use normalizer::{NormalizeOutcome, RankNormalizer, SkipReason};
pub use orchestration_entry::{RankRuntime, RunReport};
pub use query::{QueryError, QueryExecutor, QueryPolicy, QuerySlicer, QueryTemplate};
pub use rows::ResultRow;
pub use telemetry::{BotTelemetry, BotTelemetryBuilder};
