//! # RaveCraft (library root)
//!
//! Retrieval-augmented generation over a folder of text files:
//! - Offline ingestion: chunk, embed and index documents (`chunker`,
//!   `embedder`, `ingest`, `vector_store`).
//! - Online answering: wait for the index, then embed questions, retrieve
//!   context and ask an Ollama-compatible model (`readiness`, `pipeline`,
//!   `generation`, `template`, `server`).
//! - Plumbing: configuration (`config`), errors (`error`) and the CLI
//!   definition (`commands`).
//!
//! ## Modules
//! - [`chunker`], [`commands`], [`config`], [`embedder`], [`error`],
//!   [`generation`], [`ingest`], [`pipeline`], [`readiness`], [`server`],
//!   [`template`], [`vector_store`]

use directories::ProjectDirs;

pub mod chunker;
pub mod commands;
pub mod config;
pub mod embedder;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod pipeline;
pub mod readiness;
pub mod server;
pub mod template;
pub mod vector_store;

#[cfg(test)]
mod testing;

use error::ConfigError;

/// Return the per-platform configuration directory used by RaveCraft.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "ravecraft", "ravecraft")`, e.g. `~/.config/ravecraft` on Linux or
/// `~/Library/Application Support/com.ravecraft.ravecraft` on macOS.
///
/// The directory is **not** created by this function.
///
/// # Errors
/// [`ConfigError::NoConfigDir`] if the platform directory cannot be
/// determined (no home directory, heavily sandboxed environments).
///
/// # Examples
/// ```no_run
/// let cfg = ravecraft::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<std::path::PathBuf, ConfigError> {
    let proj_dirs =
        ProjectDirs::from("com", "ravecraft", "ravecraft").ok_or(ConfigError::NoConfigDir)?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
