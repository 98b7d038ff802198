//! Runs benchmark experiments against ephemeral cloud fleets.
//!
//! Steps, per environment group:
//!
//! 1. Build a machine image (cached in the build manifest; bust the cache
//!    with `--force-rebuild`).
//! 2. Bring up the fleet with the infrastructure provisioner.
//! 3. Run the experiments, retrying a few times if needed, streaming results
//!    to the output file as they complete.
//!
//! Requirements: `terraform`, `packer`, and `ssh`/`scp` on the path, plus
//! AWS credentials in the environment.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Report;
use serde::de::DeserializeOwned;
use spectrum_exp::packer::{BuildArgs, BuildProfile};
use spectrum_exp::run::{run_experiments, Interrupt, RunArgs};
use spectrum_exp::systems::dissent::Dissent;
use spectrum_exp::systems::express::Express;
use spectrum_exp::systems::riposte::Riposte;
use spectrum_exp::systems::spectrum::Spectrum;
use spectrum_exp::util::ResultWriter;
use spectrum_exp::Sha;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ERROR_LOG: &str = "error.log";

#[derive(Debug, Parser)]
#[command(about = "Run benchmark experiments on ephemeral cloud fleets.")]
struct Cli {
    /// Build machine images even when a cached one matches.
    #[arg(long)]
    force_rebuild: bool,

    /// Destroy all infrastructure after the run.
    #[arg(long)]
    cleanup: bool,

    /// Path for experiment results.
    #[arg(long, default_value = "results.json")]
    output: PathBuf,

    #[command(subcommand)]
    system: SystemCommand,
}

#[derive(Debug, Subcommand)]
enum SystemCommand {
    /// Run spectrum experiments (publisher, worker groups, clients).
    Spectrum {
        /// JSON list of experiments, e.g.
        /// `[{"clients": 100, "channels": 10, "message_size": 1024}]`.
        experiments_file: PathBuf,

        /// Build profile for compilation.
        #[arg(long, value_enum, default_value_t = BuildProfile::Debug)]
        build: BuildProfile,

        /// Commit(ish) to build; defaults to the last commit that touched
        /// the `spectrum/` source directory.
        #[arg(long)]
        commit: Option<String>,
    },
    /// Run express experiments (two servers, one client machine).
    Express { experiments_file: PathBuf },
    /// Run riposte experiments (leader, server, auditor, clients).
    Riposte { experiments_file: PathBuf },
    /// Run dissent experiments (two servers, one client machine).
    Dissent { experiments_file: PathBuf },
}

fn git_output(args: &[&str], dir: Option<&Path>) -> Result<String, Report> {
    let mut command = std::process::Command::new("git");
    command.args(args);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    let output = command.output().wrap_err("run git")?;
    if !output.status.success() {
        bail!("git {} failed ({})", args.join(" "), output.status);
    }
    Ok(String::from_utf8(output.stdout)
        .wrap_err("git output")?
        .trim()
        .to_string())
}

fn git_root() -> Result<PathBuf, Report> {
    Ok(PathBuf::from(git_output(
        &["rev-parse", "--show-toplevel"],
        None,
    )?))
}

/// The last commit at which the `spectrum/` source directory changed.
/// Infrastructure-only commits reuse the previous image, which spares a slow
/// image build.
fn last_source_sha(git_root: &Path) -> Result<Sha, Report> {
    Ok(git_output(&["rev-list", "-1", "HEAD", "--", "spectrum"], Some(git_root))?.into())
}

fn sha_for_commitish(git_root: &Path, commitish: &str) -> Result<Sha, Report> {
    Ok(git_output(&["rev-parse", commitish], Some(git_root))?.into())
}

fn load_experiments<E: DeserializeOwned>(path: &Path) -> Result<Vec<E>, Report> {
    let data = std::fs::read(path)
        .wrap_err_with(|| format!("read experiments file [{}]", path.display()))?;
    serde_json::from_slice(&data)
        .wrap_err_with(|| format!("parse experiments file [{}]", path.display()))
}

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let interrupt = Arc::new(Interrupt::new());
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .wrap_err("install signal handler")?;
    let handler = interrupt.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => handler.set(),
                _ = sigterm.recv() => handler.set(),
            }
        }
    });

    let output = std::fs::File::create(&cli.output)
        .wrap_err_with(|| format!("create output file [{}]", cli.output.display()))?;
    let mut writer = ResultWriter::new(output)?;
    let error_log = Path::new(ERROR_LOG);
    let args = RunArgs {
        force_rebuild: cli.force_rebuild,
        cleanup: cli.cleanup,
        build: BuildArgs::default(),
    };

    let all_ok = match cli.system {
        SystemCommand::Spectrum {
            experiments_file,
            build,
            commit,
        } => {
            let root = git_root()?;
            let sha = match commit {
                Some(commitish) => sha_for_commitish(&root, &commitish)?,
                None => last_source_sha(&root)?,
            };
            let args = RunArgs {
                build: BuildArgs {
                    profile: build,
                    sha: Some(sha),
                    git_root: Some(root),
                },
                ..args
            };
            run_experiments::<Spectrum, _>(
                load_experiments(&experiments_file)?,
                &args,
                &mut writer,
                &interrupt,
                error_log,
            )
            .await?
        }
        SystemCommand::Express { experiments_file } => {
            run_experiments::<Express, _>(
                load_experiments(&experiments_file)?,
                &args,
                &mut writer,
                &interrupt,
                error_log,
            )
            .await?
        }
        SystemCommand::Riposte { experiments_file } => {
            run_experiments::<Riposte, _>(
                load_experiments(&experiments_file)?,
                &args,
                &mut writer,
                &interrupt,
                error_log,
            )
            .await?
        }
        SystemCommand::Dissent { experiments_file } => {
            run_experiments::<Dissent, _>(
                load_experiments(&experiments_file)?,
                &args,
                &mut writer,
                &interrupt,
                error_log,
            )
            .await?
        }
    };
    writer.finish()?;

    if !all_ok {
        tracing::error!("some experiments failed after exhausting their retries");
        std::process::exit(1);
    }
    Ok(())
}
