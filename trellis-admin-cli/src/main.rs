//! Trellis Administration CLI

mod verify;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use trellis_core::{Datastore, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "trellis-admin")]
#[command(author = "Trellis Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Trellis repository administration tool")]
struct Cli {
    /// Data directory holding the database and large files; overrides the config file
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a repository with an empty main branch
    CreateRepo { org: String, repo: String },

    /// Print a branch entry as JSON
    Branch {
        org: String,
        repo: String,
        #[arg(default_value = "main")]
        branch: String,
    },

    /// Show commits on a branch that touch a folder
    Log {
        org: String,
        repo: String,
        branch: String,
        #[arg(short, long, default_value = "/")]
        path: String,
        /// Newest commit to include; defaults to the branch head
        #[arg(long)]
        at: Option<u64>,
    },

    /// Write a file's resolved contents to stdout
    CatFile {
        org: String,
        repo: String,
        file_id: String,
    },

    /// Walk the diff chains of one or more files and report damage
    VerifyFile {
        org: String,
        repo: String,
        #[arg(required = true)]
        file_ids: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
    },
}

fn open(cli: &Cli) -> Result<Datastore> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Datastore::open(&config).with_context(|| format!("Failed to open datastore at {:?}", config.data_dir))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let datastore = open(&cli)?;

    match &cli.command {
        Commands::CreateRepo { org, repo } => {
            let entry = datastore.create_repo(org, repo).await?;
            println!("Created repository {}/{}", entry.org, entry.repo);
        }

        Commands::Branch { org, repo, branch } => {
            let entry = datastore
                .get_branch(org, repo, branch)
                .await?
                .ok_or_else(|| anyhow!("Branch {} not found in {}/{}", branch, org, repo))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "name": entry.name,
                    "baseCommitId": entry.base_commit_id,
                    "headCommitId": entry.head_commit_id,
                }))?
            );
        }

        Commands::Log {
            org,
            repo,
            branch,
            path,
            at,
        } => {
            let at = match at {
                Some(at) => *at,
                None => {
                    datastore
                        .get_branch(org, repo, branch)
                        .await?
                        .ok_or_else(|| anyhow!("Branch {} not found in {}/{}", branch, org, repo))?
                        .head_commit_id
                }
            };
            for commit in datastore.log(org, repo, branch, path, at).await? {
                println!("{}:{}  {}  {}", commit.branch_name, commit.commit_id, commit.author_user_id, commit.message);
                for changed in &commit.changed_paths {
                    println!("    {:?} {}", changed.change_type, changed.path);
                }
            }
        }

        Commands::CatFile { org, repo, file_id } => {
            let contents = datastore.file_contents(org, repo, file_id).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&contents)?;
            stdout.flush()?;
        }

        Commands::VerifyFile {
            org,
            repo,
            file_ids,
            quiet,
        } => {
            verify::verify_files(&datastore, org, repo, file_ids, *quiet).await?;
        }
    }

    Ok(())
}
