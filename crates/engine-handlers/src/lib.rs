//! Job handlers (spec.md S4.7): the business logic the engine dispatches
//! to once it has claimed and leased a job. Both handlers share one
//! pipeline shape — compile, call, parse, persist — and both submit
//! their writes through `engine-warehouse-sqlite`'s `TxBatchWriter` so a
//! handler's return only happens after its writes have committed.
//!
//! The `fake` job type (spec.md S9 open question) has no business logic
//! of its own and lives in `engine_core::FakeHandler`; this crate only
//! carries the two handlers that actually touch the provider and the
//! warehouse.

pub mod analysis;
pub mod embedding;
pub mod embedding_source;
pub mod prompt;
pub mod vector;

pub use analysis::AnalysisHandler;
pub use embedding::EmbeddingHandler;
pub use embedding_source::{resolve_input_text, EmbeddingInput, EmbeddingSource};
pub use prompt::{CompiledPrompt, PromptCompiler};
pub use vector::encode_vector;
