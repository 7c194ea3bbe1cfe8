//! Thin launcher wiring `engine-core`'s pieces into a runnable worker
//! process: a `SqliteJobStore` queue, an `HttpProviderClient`, a
//! `SqliteTransactor` warehouse behind a `TxBatchWriter`, the leaky
//! bucket and both adaptive controllers, and the `analysis`, `embedding`,
//! and `fake` handlers, driven by one `Engine` until `Ctrl-C` or the
//! queue drains.
//!
//! The prompt compiler and embedding source are named as external
//! collaborators out of scope for this system (spec.md S1); the stand-in
//! implementations below exist only so this binary is runnable end to
//! end, the same role `FakeHandler` plays for the `fake` job type.

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use engine_core::{
    AdaptiveController, AdaptiveControllerConfig, AdaptiveSemaphore, AutoRpmConfig,
    AutoRpmController, BatchConfig, Cancellation, EngineBuilder, EngineConfig, FakeHandler,
    HandlerError, LeakyBucket, TxBatchWriter,
};
use engine_handlers::{AnalysisHandler, CompiledPrompt, EmbeddingHandler, EmbeddingInput, EmbeddingSource, PromptCompiler};
use engine_provider::{HttpProviderClient, ProviderConfig};
use engine_queue_sqlite::SqliteJobStore;
use engine_warehouse_sqlite::SqliteTransactor;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Command-line surface for the demo binary (spec.md S9's `EngineConfig`
/// fields, each overridable via `--flag` or the matching `RUN_ENGINE_*`
/// env var).
#[derive(Debug, Parser)]
#[command(name = "run-engine", about = "Drains the compute-engine job queue")]
struct Cli {
    /// SQLite URL for the durable job queue, e.g. `sqlite://queue.db`.
    #[arg(long, env = "RUN_ENGINE_QUEUE_URL", default_value = "sqlite://queue.db")]
    queue_url: String,

    /// SQLite URL for the warehouse database the handlers write to.
    #[arg(long, env = "RUN_ENGINE_WAREHOUSE_URL", default_value = "sqlite://warehouse.db")]
    warehouse_url: String,

    /// Base URL of the generative-AI provider.
    #[arg(long, env = "RUN_ENGINE_PROVIDER_BASE_URL")]
    provider_base_url: String,

    /// API key for the generative-AI provider.
    #[arg(long, env = "RUN_ENGINE_PROVIDER_API_KEY")]
    provider_api_key: String,

    /// Model used for embedding jobs.
    #[arg(long, env = "RUN_ENGINE_EMBEDDING_MODEL", default_value = "embedding-001")]
    embedding_model: String,

    #[arg(long, env = "RUN_ENGINE_WORKER_COUNT", default_value_t = 10)]
    worker_count: usize,

    /// Requests per minute the leaky bucket starts at, before the
    /// auto-RPM controller retunes it.
    #[arg(long, env = "RUN_ENGINE_INITIAL_RPM", default_value_t = 600.0)]
    initial_rpm: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig {
        worker_count: cli.worker_count,
        ..EngineConfig::default()
    };

    let queue = Arc::new(
        SqliteJobStore::connect(&cli.queue_url)
            .await
            .context("connecting to job queue database")?,
    );
    let warehouse = SqliteTransactor::connect(&cli.warehouse_url, (cli.worker_count as u32).max(1))
        .await
        .context("connecting to warehouse database")?;
    let writer = Arc::new(TxBatchWriter::new(
        warehouse,
        BatchConfig {
            batch_size: config.tx_batch_size,
            flush_interval: config.tx_flush_interval,
            channel_capacity: 512,
        },
    ));

    let leaky_bucket = LeakyBucket::new(cli.initial_rpm);
    let semaphore = AdaptiveSemaphore::new(config.worker_count);
    let auto_rpm = Arc::new(AutoRpmController::new(
        AutoRpmConfig {
            initial_rpm: cli.initial_rpm,
            ..AutoRpmConfig::default()
        },
        leaky_bucket.clone(),
    ));
    let adaptive_controller = Arc::new(AdaptiveController::new(
        AdaptiveControllerConfig::for_worker_count(config.worker_count),
        semaphore.clone(),
    ));

    let provider = Arc::new(
        HttpProviderClient::new(
            ProviderConfig {
                max_retries: config.provider_max_retries,
                initial_backoff: config.provider_initial_backoff,
                max_backoff: config.provider_max_backoff,
                ..ProviderConfig::new(cli.provider_base_url, cli.provider_api_key)
            },
            leaky_bucket,
            auto_rpm.clone(),
            adaptive_controller.clone(),
        )
        .context("building provider HTTP client")?,
    );

    let analysis_handler = Arc::new(AnalysisHandler::new(
        provider.clone(),
        Arc::new(StubPromptCompiler),
        writer.clone(),
        true,
    ));
    let embedding_handler = Arc::new(EmbeddingHandler::new(
        provider,
        Arc::new(StubEmbeddingSource),
        writer.clone(),
        cli.embedding_model,
    ));

    let engine = EngineBuilder::new(config, queue, semaphore, auto_rpm, adaptive_controller)
        .register_handler("analysis", analysis_handler)
        .register_handler("embedding", embedding_handler)
        .register_handler("fake", Arc::new(FakeHandler::default()))
        .build();

    let cancellation = Cancellation::new();
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, winding down workers");
            shutdown.cancel();
        }
    });

    let stats = engine.run(cancellation).await;
    info!(stats = %stats.to_json(), "engine run finished");

    // `engine` was consumed by `run`, taking the handlers (and their
    // writer handles) down with it, so this is the last reference.
    Arc::try_unwrap(writer)
        .expect("writer still referenced after engine shutdown")
        .close()
        .await;

    Ok(())
}

/// Returns fixed placeholder text for every conversation, so the binary
/// is runnable without a real prompt-compilation service wired in.
struct StubPromptCompiler;

#[async_trait]
impl PromptCompiler for StubPromptCompiler {
    async fn compile(&self, conversation_id: &str, _prompt_id: &str) -> Result<CompiledPrompt, HandlerError> {
        Ok(CompiledPrompt {
            system_text: Some("Extract topics, entities, emotions, and humor from the conversation.".into()),
            user_text: format!("Conversation {conversation_id} (placeholder: no prompt service configured)"),
            response_schema: None,
            model_name: "gemini-pro".into(),
            fallback_models: vec![],
        })
    }
}

/// Embeds the entity id itself, so the binary is runnable without a real
/// transcript/facet store wired in.
struct StubEmbeddingSource;

#[async_trait]
impl EmbeddingSource for StubEmbeddingSource {
    async fn text_for(&self, entity_type: &str, entity_id: &str) -> Result<EmbeddingInput, HandlerError> {
        Ok(EmbeddingInput::PlainText(format!("{entity_type}:{entity_id}")))
    }
}
