//! SPARQL query service access: transport, pacing, retry and slicing.

/// Sliced query templates and result bindings.
pub mod template;
/// HTTP transport abstraction and its reqwest implementation.
pub mod transport;
/// Injectable delays.
pub mod pacing;
/// Single-query execution with failure classification and retry.
pub mod executor;
/// Offset-driven pagination over the executor.
pub mod slicer;

pub use executor::{QueryError, QueryExecutor, QueryPolicy};
pub use pacing::{RecordingSleeper, Sleeper, TokioSleeper};
pub use slicer::QuerySlicer;
pub use template::{Binding, BindingTerm, QueryTemplate, PREFERRED_WITHOUT_NORMAL};
pub use transport::{QueryTransport, RawResponse, ReqwestQueryTransport, ScriptedTransport};
