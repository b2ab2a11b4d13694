//! Entity state as read from the repository, and the edits written back.

/// Ranks, claims and items.
pub mod model;
/// Repository abstraction, edit requests and the in-memory store.
pub mod repository;
/// Wikibase action API client.
pub mod wikibase;

pub use model::{Claim, ClaimError, EntityItem, Rank};
pub use repository::{EditReceipt, EntityEdit, EntityRepository, MemoryRepository, RepositoryError};
pub use wikibase::WikibaseRepository;
