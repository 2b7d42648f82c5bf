//! muster - compose-style deployment orchestration
//!
//! This is the main CLI entry point for muster.

use clap::{Args, Parser, Subcommand};
use muster::compose::{ComposeParser, EnvSource};
use muster::error::{MusterError, Result};
use muster::image::{DigestBuildBackend, ImageBuilder};
use muster::manifest::{Manifest, DEFAULT_PROFILE};
use muster::orchestrator::{Orchestrator, RunState, ServiceStatus, StatusEvent};
use muster::runtime::ProcessRuntime;
use muster::settings::{Overrides, Settings};
use muster::storage::{Binder, VolumeStore};
use muster::watch::{FsWatcher, Reconciler};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// muster - compose-style deployment orchestration
#[derive(Parser)]
#[command(name = "muster")]
#[command(version)]
#[command(about = "Bring up a compose project in dependency order", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Project name
    #[arg(short, long, global = true)]
    project_name: Option<String>,

    /// Project directory (default: directory of the first compose file)
    #[arg(long, global = true)]
    project_directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that reads the manifest
#[derive(Args, Clone)]
struct ProjectArgs {
    /// Compose file, repeatable; later files override earlier ones
    #[arg(short, long)]
    file: Vec<PathBuf>,

    /// Env file, repeatable; later files override earlier ones
    #[arg(long)]
    env_file: Vec<PathBuf>,

    /// Deployment profile
    #[arg(long, default_value = DEFAULT_PROFILE)]
    profile: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, start and (optionally) watch the project
    Up {
        #[command(flatten)]
        project: ProjectArgs,
        /// Return once services have settled instead of staying attached
        #[arg(short, long)]
        detach: bool,
        /// Do not watch the project directory for changes
        #[arg(long)]
        no_watch: bool,
        /// Print the start order and build plans without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop services started by a detached `up`
    Down {
        #[command(flatten)]
        project: ProjectArgs,
        /// Also remove managed volumes
        #[arg(short, long)]
        volumes: bool,
    },

    /// Build images for services with a build section
    Build {
        #[command(flatten)]
        project: ProjectArgs,
        /// Services to build (default: all)
        services: Vec<String>,
    },

    /// Show services recorded by a detached `up`
    Ps {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Print the resolved manifest
    Config {
        #[command(flatten)]
        project: ProjectArgs,
        /// Print service names only
        #[arg(long)]
        services: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let overrides = |project: &ProjectArgs| Overrides {
        project_name: cli.project_name.clone(),
        project_directory: cli.project_directory.clone(),
        files: project.file.clone(),
        env_files: project.env_file.clone(),
    };

    match &cli.command {
        Commands::Up {
            project,
            detach,
            no_watch,
            dry_run,
        } => {
            let settings = resolve_settings(&overrides(project))?;
            let manifest = load_manifest(&settings, &project.profile)?;
            if *dry_run {
                return dry_run_plan(&manifest);
            }
            up(settings, manifest, *detach, !*no_watch).await
        }
        Commands::Down { project, volumes } => {
            let settings = resolve_settings(&overrides(project))?;
            let manifest = match load_manifest(&settings, &project.profile) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    tracing::warn!("Using default grace periods: {}", e);
                    None
                }
            };
            down(&settings, manifest.as_ref(), *volumes).await
        }
        Commands::Build { project, services } => {
            let settings = resolve_settings(&overrides(project))?;
            let manifest = load_manifest(&settings, &project.profile)?;
            build(&manifest, services).await
        }
        Commands::Ps { project } => {
            let settings = resolve_settings(&overrides(project))?;
            ps(&settings)
        }
        Commands::Config { project, services } => {
            let settings = resolve_settings(&overrides(project))?;
            let manifest = load_manifest(&settings, &project.profile)?;
            if *services {
                for name in manifest.services.keys() {
                    println!("{}", name);
                }
            } else {
                print!("{}", serde_yaml::to_string(&manifest)?);
            }
            Ok(0)
        }
    }
}

fn resolve_settings(overrides: &Overrides) -> Result<Settings> {
    let cwd = std::env::current_dir()?;
    Settings::resolve(overrides, &cwd)
}

fn load_manifest(settings: &Settings, profile: &str) -> Result<Manifest> {
    let env = settings.env_source(EnvSource::from_process())?;
    let config = ComposeParser::parse_files(&settings.files, &env)?;
    let project = settings.project_name(config.name.as_deref());
    let manifest = Manifest::resolve(&config, profile, &settings.project_dir, &project)?;
    for warning in &manifest.warnings {
        tracing::warn!("{}", warning);
    }
    Ok(manifest)
}

fn dry_run_plan(manifest: &Manifest) -> Result<u8> {
    let graph = muster::orchestrator::ServiceGraph::from_manifest(manifest)?;
    println!(
        "Project {} (profile {})",
        manifest.project, manifest.profile.name
    );
    println!("Start order:");
    print!("{}", graph.start_plan());

    for file in ImageBuilder::plan(manifest, &[])? {
        print_build_plan(&file);
    }
    Ok(0)
}

fn print_build_plan(file: &muster::image::FilePlan) {
    println!("Build {}:", file.dockerfile.display());
    for (i, step) in file.plan.steps.iter().enumerate() {
        let from = step
            .parent
            .as_deref()
            .or(step.base_image.as_deref())
            .unwrap_or("scratch");
        let targets: Vec<&str> = step.targets.iter().map(String::as_str).collect();
        println!(
            "{:>3}. {} (from {}) for {}",
            i + 1,
            step.stage,
            from,
            targets.join(", ")
        );
    }
    for (service, target) in &file.services {
        println!("     {} -> {}", service, target);
    }
}

async fn up(settings: Settings, manifest: Manifest, detach: bool, watch: bool) -> Result<u8> {
    // Build files must parse before the previous run is touched
    ImageBuilder::plan(&manifest, &[])?;

    if let Some(previous) = RunState::load(&settings.state_dir)? {
        if !previous.instances.is_empty() {
            tracing::warn!(
                "Project {} has instances from an earlier run, stopping them",
                previous.project
            );
            stop_recorded(&previous, Some(&manifest), &settings).await?;
            RunState::remove(&settings.state_dir)?;
        }
    }

    let manifest = Arc::new(manifest);

    let mut runtime = ProcessRuntime::new(settings.rootfs_dir())?;
    if detach {
        runtime = runtime.with_log_dir(settings.logs_dir())?;
    }
    let store = Arc::new(VolumeStore::new(settings.volumes_dir())?);
    let binder = Binder::new(manifest.clone(), store);
    let builder = ImageBuilder::new(&manifest.project, Arc::new(DigestBuildBackend::new()));
    let orchestrator = Orchestrator::new(manifest.clone(), Arc::new(runtime), builder, binder)?;

    println!(
        "Starting project {} (profile {})",
        manifest.project, manifest.profile.name
    );
    let printer = tokio::spawn(track_status(
        orchestrator.clone(),
        settings.state_dir.clone(),
        orchestrator.board().subscribe(),
    ));

    let report = tokio::select! {
        report = orchestrator.up() => report?,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, stopping project {}", manifest.project);
            let code = teardown(&orchestrator, &settings).await?;
            printer.abort();
            return Ok(code);
        }
    };

    save_state(&orchestrator, &settings.state_dir).await?;
    for failure in &report.failures {
        eprintln!("error: {}", failure.message);
    }

    if detach {
        printer.abort();
        println!(
            "Project {} started, run `muster down` to stop it",
            manifest.project
        );
        return Ok(report.exit_code());
    }

    let mut _watcher = None;
    if watch && manifest.profile.watch {
        let rules = manifest.watch_rules();
        if !rules.is_empty() {
            let reconciler = Reconciler::new(
                &manifest.project_dir,
                rules,
                Arc::new(orchestrator.clone()),
                settings.debounce,
            )?;
            let (fs, events) = FsWatcher::start(&reconciler.roots())?;
            _watcher = Some(fs);
            let shutdown = orchestrator.shutdown_signal();
            tokio::spawn(async move {
                if let Err(e) = reconciler.run(events, shutdown).await {
                    tracing::error!("Watch stopped: {}", e);
                }
            });
        }
    }

    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("Stopping project {}", manifest.project);

    teardown(&orchestrator, &settings).await?;
    printer.abort();
    Ok(report.exit_code())
}

/// Stop everything within the shutdown grace period. Whatever is still
/// running afterwards stays recorded for `muster down`.
async fn teardown(orchestrator: &Orchestrator, settings: &Settings) -> Result<u8> {
    match tokio::time::timeout(settings.shutdown_grace, orchestrator.down()).await {
        Ok(stopped) => {
            let stopped = stopped?;
            tracing::debug!("Stopped {:?}", stopped);
            RunState::remove(&settings.state_dir)?;
            Ok(0)
        }
        Err(_) => {
            save_state(orchestrator, &settings.state_dir).await?;
            Err(MusterError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "shutdown did not finish within {:?}, run `muster down` to stop the rest",
                    settings.shutdown_grace
                ),
            )))
        }
    }
}

async fn save_state(orchestrator: &Orchestrator, state_dir: &Path) -> Result<()> {
    let manifest = orchestrator.manifest();
    let mut state = RunState::load(state_dir)?
        .filter(|s| s.project == manifest.project)
        .unwrap_or_else(|| RunState::new(&manifest.project, &manifest.profile.name));
    state.instances = orchestrator.instances().await;
    state.save(state_dir)
}

/// Print status changes and keep the run state current as instances change.
async fn track_status(
    orchestrator: Orchestrator,
    state_dir: PathBuf,
    mut events: broadcast::Receiver<StatusEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let reason = event
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default();
                println!("{:<20} {}{}", event.service, event.to, reason);

                if event.to == ServiceStatus::Started {
                    if let Err(e) = save_state(&orchestrator, &state_dir).await {
                        tracing::warn!("Failed to record run state: {}", e);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!("Missed {} status events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn stop_recorded(
    state: &RunState,
    manifest: Option<&Manifest>,
    settings: &Settings,
) -> Result<()> {
    for instance in state.stop_order() {
        let Some(pid) = instance.pid else {
            continue;
        };
        let grace = manifest
            .and_then(|m| m.services.get(&instance.service))
            .map(|s| s.stop_grace_period)
            .unwrap_or(settings.stop_grace);
        println!("Stopping {}", instance.service);
        ProcessRuntime::terminate(pid, grace).await?;
    }
    Ok(())
}

async fn down(settings: &Settings, manifest: Option<&Manifest>, volumes: bool) -> Result<u8> {
    match RunState::load(&settings.state_dir)? {
        Some(state) => {
            stop_recorded(&state, manifest, settings).await?;
            RunState::remove(&settings.state_dir)?;
            println!("Stopped project {}", state.project);
        }
        None => println!("Nothing to stop"),
    }

    if volumes {
        let store = VolumeStore::new(settings.volumes_dir())?;
        for volume in store.list()? {
            store.remove(&volume.name, true)?;
            println!("Removed volume {}", volume.name);
        }
    }
    Ok(0)
}

async fn build(manifest: &Manifest, services: &[String]) -> Result<u8> {
    let plans = ImageBuilder::plan(manifest, services)?;
    if plans.is_empty() {
        println!("No services to build");
        return Ok(0);
    }

    let builder = ImageBuilder::new(&manifest.project, Arc::new(DigestBuildBackend::new()));
    let mut code = 0;
    for file in &plans {
        print_build_plan(file);
        for (service, result) in builder.build(file).await {
            match result {
                Ok(image) => println!("Built {} -> {}", service, image.reference),
                Err(e) => {
                    eprintln!("error: {}", e);
                    code = e.exit_code();
                }
            }
        }
    }
    Ok(code)
}

fn ps(settings: &Settings) -> Result<u8> {
    let Some(state) = RunState::load(&settings.state_dir)? else {
        println!("No running project");
        return Ok(0);
    };

    println!(
        "{:<20} {:<10} {:<8} {:<28} STARTED",
        "SERVICE", "STATUS", "PID", "IMAGE"
    );
    for instance in &state.instances {
        let status = match instance.pid {
            Some(pid) if ProcessRuntime::is_running(pid) => "running",
            Some(_) => "exited",
            None => "idle",
        };
        let pid = instance
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<10} {:<8} {:<28} {}",
            instance.service,
            status,
            pid,
            instance.image.as_deref().unwrap_or("-"),
            instance.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(0)
}
