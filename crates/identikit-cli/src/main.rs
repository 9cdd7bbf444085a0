use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use identikit_core::LabelMetadata;
use identikit_engine::{open_engine, Config, InferResponse, LabelsResponse};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "identikit", about = "Local face enrollment and recognition")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the engine starts
    Health,
    /// List enrolled labels with their sample counts
    Labels,
    /// Recognize the face in an image
    Infer {
        image: PathBuf,
    },
    /// Add face images for a label and retrain
    Enroll {
        #[arg(short, long)]
        label: String,
        #[command(flatten)]
        metadata: MetadataArgs,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Retrain the model from every stored sample
    Rebuild,
    /// Delete a label, its samples and its metadata
    Delete {
        label: String,
    },
    /// Show the metadata stored for a label
    Metadata {
        label: String,
    },
    /// Update metadata fields for a label
    SetMetadata {
        label: String,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
}

#[derive(Args)]
struct MetadataArgs {
    #[arg(long)]
    title: Option<String>,
    /// Case reference
    #[arg(long = "case")]
    case_ref: Option<String>,
    #[arg(long)]
    sex: Option<String>,
    #[arg(long)]
    age: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

impl From<MetadataArgs> for LabelMetadata {
    fn from(args: MetadataArgs) -> Self {
        LabelMetadata {
            title: args.title,
            case_ref: args.case_ref,
            sex: args.sex,
            age: args.age,
            address: args.address,
            notes: args.notes,
            updated_at: None,
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");
    let engine = open_engine(&config).context("starting engine")?;

    match cli.command {
        Commands::Health => print_json(&engine.health())?,
        Commands::Labels => print_json(&LabelsResponse::from(engine.list_labels()))?,
        Commands::Infer { image } => {
            let bytes = read_image(&image)?;
            let inference = engine.infer(&bytes)?;
            print_json(&InferResponse::from(inference))?;
        }
        Commands::Enroll {
            label,
            metadata,
            images,
        } => {
            let images = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            let resp = engine.enroll(&label, images, metadata.into()).await?;
            print_json(&resp)?;
        }
        Commands::Rebuild => print_json(&engine.rebuild().await?)?,
        Commands::Delete { label } => print_json(&engine.delete_label(&label).await?)?,
        Commands::Metadata { label } => print_json(&engine.label_metadata(&label)?)?,
        Commands::SetMetadata { label, metadata } => {
            print_json(&engine.set_metadata(&label, metadata.into()).await?)?;
        }
    }

    Ok(())
}
