use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tawjih",
    version,
    about = "Tunisian orientation-guide score extraction and normalization tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Extract(ExtractArgs),
    Transform(TransformArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, default_value = ".cache/tawjih")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub tables_path: Option<PathBuf>,

    #[arg(long)]
    pub records_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub rules_path: Option<PathBuf>,

    #[arg(long, default_value_t = 40)]
    pub start_page: u32,
}

#[derive(Args, Debug, Clone)]
pub struct TransformArgs {
    #[arg(long, default_value = ".cache/tawjih")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub records_path: Option<PathBuf>,

    #[arg(long)]
    pub dataset_path: Option<PathBuf>,

    #[arg(long)]
    pub corpus_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub rules_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/tawjih")]
    pub cache_root: PathBuf,
}
