use std::path::PathBuf;

use anyhow::Context;
use remotefs::cache::paths;
use remotefs::cache::{FileType, OpOutcome};
use remotefs::config::SessionConfig;
use remotefs::session::Session;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: remotefs <command>
  ls <path>                        List a remote folder
  get <remote-folder> [local-dir]  Download a remote folder (default: REMOTEFS_DOWNLOAD_DIR)
  put <local-folder> <remote-folder>
                                   Upload a local folder into a remote folder
  --help                           Show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    List { path: String },
    Get { remote: String, local: Option<PathBuf> },
    Put { local: PathBuf, remote: String },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mode = match args.as_slice() {
        [] | ["--help"] | ["-h"] => CliMode::Help,
        ["ls"] => CliMode::List { path: "/".into() },
        ["ls", path] => CliMode::List {
            path: path.to_string(),
        },
        ["get", remote] => CliMode::Get {
            remote: remote.to_string(),
            local: None,
        },
        ["get", remote, local] => CliMode::Get {
            remote: remote.to_string(),
            local: Some(PathBuf::from(local)),
        },
        ["put", local, remote] => CliMode::Put {
            local: PathBuf::from(local),
            remote: remote.to_string(),
        },
        [command, ..] => anyhow::bail!("unknown or incomplete command: {command}"),
    };
    Ok(mode)
}

/// Accepts both `/<root>/a/b` and root-relative `a/b`.
fn remote_path(root_name: &str, arg: &str) -> String {
    match paths::segments(arg).first() {
        Some(first) if *first == root_name => paths::normalize(arg),
        _ => paths::join(&format!("/{root_name}"), arg),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("REMOTEFS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report(outcome: OpOutcome, message: &str) -> anyhow::Result<()> {
    match outcome {
        OpOutcome::Good => {
            println!("{message}");
            Ok(())
        }
        other => anyhow::bail!("{message} ({other:?})"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }
    init_tracing();

    let config = SessionConfig::from_env()?;
    let mut session = Session::bootstrap(&config).await?;
    let root = config.root_name.as_str();
    match mode {
        CliMode::List { path } => {
            let path = remote_path(root, &path);
            let entries = session
                .list(&path)
                .await?
                .with_context(|| format!("{path} does not exist"))?;
            for entry in entries {
                let marker = if entry.file_type() == FileType::Directory {
                    "d"
                } else {
                    "-"
                };
                println!("{marker} {:>12} {}", entry.size(), entry.name());
            }
            Ok(())
        }
        CliMode::Get { remote, local } => {
            let local = local.unwrap_or_else(|| config.download_dir.clone());
            let (outcome, message) = session
                .download_folder(&remote_path(root, &remote), &local)
                .await?;
            report(outcome, &message)
        }
        CliMode::Put { local, remote } => {
            let (outcome, message) = session
                .upload_folder(&local, &remote_path(root, &remote))
                .await?;
            report(outcome, &message)
        }
        CliMode::Help => Ok(()),
    }
}
