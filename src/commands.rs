//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum with one variant per subcommand.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use ravecraft::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Serve => { /* start the HTTP service */ }
//!     _ => { /* batch and helper commands */ }
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Config file. Defaults to `config.yaml` in the platform config directory.
    #[arg(long, global = true, env = "RAVECRAFT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Wait for the collection, then answer questions over HTTP.
    Serve,

    /// Embed every *.txt file under a directory and rebuild the collection.
    Ingest {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Embedding model id.
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        collection: Option<String>,

        /// Vector store host.
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        no_progress: bool,
    },

    /// Print the embedding of a question as JSON.
    Embed { question: String },

    /// Search the collection with a raw vector and print matching chunks.
    Retrieve {
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        vector: Vec<f32>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        collection: Option<String>,

        #[arg(short = 'k')]
        k: Option<usize>,

        #[arg(long)]
        nprobe: Option<usize>,
    },

    /// Print the prompt that would be sent for a question and context chunks.
    Prompt {
        question: String,

        #[arg(required = true)]
        chunks: Vec<String>,
    },

    /// Write the default configuration file.
    Init,
}
