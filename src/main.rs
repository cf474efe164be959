//! Main module for the RaveCraft CLI application (`ravecraft`).
//!
//! Parses the command line, loads configuration and runs the requested
//! pipeline: the HTTP service, the ingestion job, or one of the helpers.
//!
//! # Examples
//!
//! ```sh
//! ravecraft init
//! ravecraft ingest --data-dir data
//! ravecraft serve
//! ravecraft prompt "How much?" "Price: \$10" "Ships in 2 days"
//! ```

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ravecraft::{
    commands::{Cli, Commands},
    config::{self, RagConfig},
    embedder::{CandleEmbedder, Embedder},
    error::{EmbedError, RagError},
    generation::GenerationClient,
    ingest::Ingestor,
    pipeline::QueryOptions,
    readiness::ReadinessGate,
    server,
    template::{self, PromptTemplate},
    vector_store::{self, VectorIndex},
};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    });

    let cli = Cli::parse();
    let result = tokio::runtime::Runtime::new()
        .map_err(Box::<dyn Error>::from)
        .and_then(|runtime| runtime.block_on(run(cli)));
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Loads configuration and executes the parsed command.
async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if cli.command == Commands::Init {
        return init();
    }

    let mut config = config::load_config(cli.config.as_deref())?;
    debug!("Config loaded: {:?}", config);

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Ingest {
            data_dir,
            model,
            collection,
            host,
            port,
            no_progress,
        } => {
            if let Some(model) = model {
                config.embedding.model = model;
            }
            apply_store_overrides(&mut config, host, port, collection);
            config.validate()?;
            ingest(&config, &data_dir, !no_progress).await?;
        }
        Commands::Embed { question } => {
            let embedder = load_embedder(&config).await?;
            let vector = embedder.embed_async(question).await?;
            println!("{}", serde_json::to_string(&vector)?);
        }
        Commands::Retrieve {
            vector,
            host,
            port,
            collection,
            k,
            nprobe,
        } => {
            apply_store_overrides(&mut config, host, port, collection);
            config.validate()?;
            let k = k.unwrap_or(config.retrieval.top_k);
            let nprobe = nprobe.unwrap_or(config.retrieval.nprobe);
            let chunks = retrieve(&config, &vector, k, nprobe).await?;
            println!("{}", chunks.join("\n\n"));
        }
        Commands::Prompt { question, chunks } => {
            println!("{}", prompt_template(&config)?.build(&chunks, &question));
        }
        Commands::Init => init()?,
    }

    Ok(())
}

fn apply_store_overrides(
    config: &mut RagConfig,
    host: Option<String>,
    port: Option<u16>,
    collection: Option<String>,
) {
    if let Some(host) = host {
        config.store.host = host;
    }
    if let Some(port) = port {
        config.store.port = port;
    }
    if let Some(collection) = collection {
        config.store.collection = collection;
    }
}

fn prompt_template(config: &RagConfig) -> Result<PromptTemplate, RagError> {
    match &config.prompt_template {
        Some(path) => Ok(template::load_template(path)?),
        None => Ok(PromptTemplate::default()),
    }
}

/// Load the embedding model off the async runtime (download and mmap block).
async fn load_embedder(config: &RagConfig) -> Result<Embedder, RagError> {
    let model = config.embedding.model.clone();
    let revision = config.embedding.revision.clone();
    let loaded = tokio::task::spawn_blocking(move || CandleEmbedder::load(&model, &revision))
        .await
        .map_err(|e| EmbedError::Join(e.to_string()))??;
    Ok(Embedder::new(Arc::new(loaded)))
}

async fn serve(config: &RagConfig) -> Result<(), Box<dyn Error>> {
    let addr = config.bind_addr()?;
    let options = QueryOptions {
        top_k: config.retrieval.top_k,
        nprobe: config.retrieval.nprobe,
        template: prompt_template(config)?,
    };
    let embedder = load_embedder(config).await?;
    let generator = Arc::new(GenerationClient::new(&config.llm)?);
    info!(url = generator.url(), model = generator.model(), "Generation backend");

    let store = vector_store::open_store(&config.store)?;
    let gate = ReadinessGate::new(store, config.store.collection.clone(), config.backoff());
    let context = gate.open(embedder, generator, options).await?;

    let served = server::serve(addr, context.pipeline(), shutdown_signal()).await;
    context.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
    }
}

async fn ingest(
    config: &RagConfig,
    data_dir: &std::path::Path,
    progress: bool,
) -> Result<(), Box<dyn Error>> {
    let chunker = config.chunker()?;
    let embedder = load_embedder(config).await?;
    let store = vector_store::open_store(&config.store)?;

    let ingestor = Ingestor::new(embedder, chunker, store)
        .with_batch_size(config.store.insert_batch_size)
        .with_progress(progress);
    let report = ingestor.run(data_dir, &config.store.collection).await?;

    println!(
        "✓ Done: {} vectors from {} documents in '{}' (dim={})",
        report.records, report.documents, config.store.collection, report.dimension
    );
    Ok(())
}

/// Connect, search once and disconnect. A collection some other process has
/// loaded (a running `serve`) is searched in place and left loaded.
async fn retrieve(
    config: &RagConfig,
    vector: &[f32],
    k: usize,
    nprobe: usize,
) -> Result<Vec<String>, RagError> {
    let store = vector_store::open_store(&config.store)?;
    store.connect().await?;
    let index = VectorIndex::open(Arc::clone(&store), config.store.collection.clone());

    let result = index.search_once(vector, k, nprobe).await;
    store.disconnect().await?;

    let hits = result?;
    info!("retrieve(): {} chunks (k={k}, nprobe={nprobe})", hits.len());
    Ok(hits.into_iter().map(|h| h.chunk).collect())
}

/// Writes the default configuration to the platform config directory.
fn init() -> Result<(), Box<dyn Error>> {
    let path = ravecraft::config_dir()?.join("config.yaml");
    config::write_default_config(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
