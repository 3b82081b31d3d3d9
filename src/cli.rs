use crate::config::loader::RenderboxConfig;
use crate::config::types::{
    AssetUpload, ReapPolicy, RenderOutcome, RenderboxError, ResourceKey,
};
use crate::core::{AssetStore, JobCoordinator, RenderReport};
use crate::mirror::{AssetMirror, LocalDirMirror, MirrorQueue};
use crate::safety::LockManager;
use crate::security::filename::has_allowed_extension;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a renderbox.json configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Working directory holding uploads, output and locks
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and store a scene file
    Submit {
        /// Scene file to upload
        file: PathBuf,
        /// Render right after the upload is accepted
        #[arg(long)]
        render: bool,
    },
    /// Render a stored scene
    Render {
        /// Resource key (file stem of the uploaded scene)
        key: String,
    },
    /// List stored scenes and their artifacts
    List,
    /// Show lock markers currently held
    Status,
    /// Remove stale lock markers. Without --expired every marker is
    /// removed, which requires that no other renderbox process is running.
    Sweep {
        /// Only remove markers whose lease expired or whose owner is gone
        #[arg(long)]
        expired: bool,
    },
    /// Fetch scenes from a mirror directory and ingest them
    MirrorSync {
        /// Directory to mirror from
        #[arg(long)]
        source: PathBuf,
        /// Seconds to wait for queued fetches
        #[arg(long, default_value_t = 300)]
        wait: u64,
    },
}

pub fn run() -> Result<()> {
    // RUST_LOG controls verbosity
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RenderboxConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RenderboxConfig::default(),
    };
    if let Some(work_dir) = cli.work_dir {
        config.paths.work_dir = work_dir;
    }

    match cli.command {
        Commands::Submit { file, render } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let coordinator = attach_or_exit(config);
            let upload = AssetUpload::new(filename, bytes);

            if render {
                let (accepted, report) =
                    coordinator.submit_and_render(upload).unwrap_or_else(|e| exit_with(&e));
                print_json(&serde_json::json!({
                    "status": "accepted",
                    "key": accepted.key,
                    "sha256": accepted.sha256,
                    "render": report_json(&report),
                }))?;
                exit_for_outcome(&report);
                return Ok(());
            }

            let accepted = coordinator.submit(upload).unwrap_or_else(|e| exit_with(&e));
            print_json(&serde_json::json!({
                "status": "accepted",
                "key": accepted.key,
                "path": accepted.path,
                "size": accepted.size,
                "sha256": accepted.sha256,
            }))
        }
        Commands::Render { key } => {
            let key = ResourceKey::parse(&key).unwrap_or_else(|e| exit_with(&e));
            let coordinator = attach_or_exit(config);
            let report = coordinator.render(&key).unwrap_or_else(|e| exit_with(&e));
            print_json(&report_json(&report))?;
            exit_for_outcome(&report);
            Ok(())
        }
        Commands::List => {
            // Read-only: no instance claim, no sweep
            let store = AssetStore::new(&config.paths, &config.renderer);
            let locks = LockManager::new(config.paths.lock_dir(), config.locks.lease_ttl())?;
            let rows: Vec<_> = store
                .list_resources()?
                .into_iter()
                .map(|stored| {
                    let owner = locks.owner(&stored.resource.key);
                    serde_json::json!({
                        "key": stored.resource.key,
                        "input": stored.resource.input_path,
                        "size": stored.input_size,
                        "artifact": stored.has_artifact.then_some(&stored.resource.artifact_path),
                        "rendering": owner.is_some(),
                    })
                })
                .collect();
            print_json(&serde_json::json!({
                "status": "OK",
                "resources": rows,
                "count": rows.len(),
            }))
        }
        Commands::Status => {
            let locks = LockManager::new(config.paths.lock_dir(), config.locks.lease_ttl())?;
            let held: Vec<_> = locks
                .held_keys()?
                .iter()
                .map(|key| {
                    serde_json::json!({
                        "key": key,
                        "owner": locks.owner(key),
                    })
                })
                .collect();
            print_json(&serde_json::json!({
                "status": "OK",
                "locks": held,
                "count": held.len(),
            }))
        }
        Commands::Sweep { expired } => {
            // Attaching always sweeps expired markers only
            let (coordinator, policy) = if expired {
                (attach_or_exit(config), ReapPolicy::Expired)
            } else {
                config.locks.reap_policy = ReapPolicy::Unconditional;
                (start_or_exit(config), ReapPolicy::Unconditional)
            };
            print_json(&serde_json::json!({
                "status": "OK",
                "policy": policy,
                "removed": coordinator.reaped_at_start(),
            }))
        }
        Commands::MirrorSync { source, wait } => {
            let coordinator = attach_or_exit(config);
            let mirror = LocalDirMirror::new(source);
            let allowed = &coordinator.config().validation.allowed_extensions;
            let assets: Vec<_> = mirror
                .list()?
                .into_iter()
                .filter(|asset| has_allowed_extension(&asset.name, allowed))
                .collect();

            let queue = MirrorQueue::new(
                Arc::new(mirror),
                coordinator.store().incoming_dir().to_path_buf(),
                &coordinator.config().mirror,
            );
            let mut skipped = Vec::new();
            for asset in assets {
                let name = asset.name.clone();
                if let Err(e) = queue.enqueue(asset) {
                    log::warn!("Not fetching {}: {}", name, e);
                    skipped.push(name);
                }
            }
            if !queue.wait_idle(Duration::from_secs(wait)) {
                log::warn!("Mirror fetches still pending after {}s", wait);
            }

            let ingested: Vec<_> = coordinator
                .ingest_fetched(&queue)
                .into_iter()
                .map(|ingest| match ingest.result {
                    Ok(accepted) => serde_json::json!({
                        "name": ingest.asset_name,
                        "status": "accepted",
                        "key": accepted.key,
                    }),
                    Err(e) => serde_json::json!({
                        "name": ingest.asset_name,
                        "status": "rejected",
                        "error": e.to_string(),
                    }),
                })
                .collect();
            queue.shutdown();

            print_json(&serde_json::json!({
                "status": "OK",
                "ingested": ingested,
                "skipped": skipped,
            }))
        }
    }
}

fn start_or_exit(config: RenderboxConfig) -> JobCoordinator {
    JobCoordinator::start(config).unwrap_or_else(|e| exit_with(&e))
}

/// One-shot commands share the namespace so renders of distinct keys can
/// run from separate processes
fn attach_or_exit(config: RenderboxConfig) -> JobCoordinator {
    JobCoordinator::attach(config).unwrap_or_else(|e| exit_with(&e))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_json(report: &RenderReport) -> serde_json::Value {
    let job = &report.job;
    let states: Vec<String> = report.states.iter().map(|s| s.to_string()).collect();
    let mut value = serde_json::json!({
        "key": job.key,
        "job_id": job.job_id,
        "started_at": job.started_at,
        "exit_code": job.exit_code,
        "signal": job.signal,
        "timed_out": job.timed_out,
        "wall_time_ms": job.wall_time.as_millis() as u64,
        "output_integrity": job.output_integrity.to_string(),
        "states": states,
    });
    match &job.outcome {
        RenderOutcome::Done(path) => {
            value["status"] = serde_json::json!("done");
            value["artifact"] = serde_json::json!(path);
        }
        RenderOutcome::Failed(failure) => {
            value["status"] = serde_json::json!("failed");
            value["error"] = serde_json::json!(failure.error.kind());
            value["message"] = serde_json::json!(failure.error.to_string());
            value["excerpt"] = serde_json::json!(failure.excerpt);
        }
    }
    value
}

fn exit_for_outcome(report: &RenderReport) {
    if let RenderOutcome::Failed(failure) = &report.job.outcome {
        std::process::exit(i32::from(&failure.error));
    }
}

fn exit_with(err: &RenderboxError) -> ! {
    let json = serde_json::json!({
        "status": if err.is_busy() { "busy" } else { "error" },
        "error": err.to_string(),
    });
    match serde_json::to_string_pretty(&json) {
        Ok(text) => println!("{}", text),
        Err(_) => eprintln!("Error: {}", err),
    }
    std::process::exit(i32::from(err));
}
