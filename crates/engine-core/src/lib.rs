//! # engine-core
//!
//! The compute-engine core of a personal iMessage-intelligence system: a
//! single-node, multi-worker job scheduler that drains a durable queue of
//! LLM-bound jobs and persists structured results to an analytics
//! warehouse, while sustaining hundreds to thousands of concurrent
//! in-flight HTTP calls against one external generative-AI provider under
//! adversarial network conditions.
//!
//! This crate defines the backend-agnostic core: the job and outcome
//! data model, the `JobStore` queue trait, the leaky-bucket rate
//! limiter and the two adaptive controllers that retune it and the
//! concurrency cap, the transactional micro-batch writer, the pluggable
//! handler interface, and the worker pool that wires all of it together.
//! Concrete backends live in sibling crates: `engine-queue-sqlite`
//! (the `JobStore` impl), `engine-warehouse-sqlite` (the `Transactor`
//! impl and warehouse write-op constructors), `engine-provider` (the
//! generative-AI HTTP client), and `engine-handlers` (the analysis and
//! embedding job handlers). `engine-testing` provides in-memory fakes of
//! all three for unit and property tests.
//!
//! ## Control flow
//!
//! Each worker loops: claim from the queue, acquire a concurrency
//! permit, dispatch to the registered handler (which internally paces
//! itself against the leaky bucket and reports pressure to both
//! controllers as it makes provider calls), report the outcome to the
//! queue, move on. See [`engine::Engine::run`].

pub mod adaptive_controller;
pub mod adaptive_semaphore;
pub mod auto_rpm;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod leaky_bucket;
pub mod model;
pub mod pressure;
pub mod queue;
pub mod writer;

pub use adaptive_controller::{AdaptiveController, AdaptiveControllerConfig, InflightSnapshot};
pub use adaptive_semaphore::{AcquireOutcome, AdaptiveSemaphore, Permit};
pub use auto_rpm::{AutoRpmConfig, AutoRpmController, RpmSnapshot};
pub use cancellation::Cancellation;
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, RunStats};
pub use error::{Categorizable, ErrorClass, HandlerError, QueueError};
pub use handler::{FakeHandler, Handler};
pub use leaky_bucket::{LeakyBucket, WaitOutcome};
pub use model::{backoff, EnqueueOpts, EnqueueResult, Job, JobState, Outcome, OutcomeClass, QueueStats};
pub use pressure::{summarize, Observation, PressureClass, WindowSummary};
pub use queue::JobStore;
pub use writer::{BatchConfig, Completion, Transactor, TxBatchWriter, WriteOp};

// Re-exported so downstream crates can build `Handler` impls without a
// separate `async-trait` dependency declaration.
pub use async_trait::async_trait;
