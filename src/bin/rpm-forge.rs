use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rpm_forge::annex::Artifact;
use rpm_forge::config::BuildConfig;
use rpm_forge::coordinator::{self, BuildResult, Coordinator, FailurePolicy};
use rpm_forge::preflight::{self, HostCapabilities, SystemHost};
use rpm_forge::process::{CancelToken, SystemRunner};
use rpm_forge::publish::{PublishResult, Publisher};
use rpm_forge::sync::Synchronizer;
use rpm_forge::testsuite::{self, TestResults, TestScript};
use rpm_forge::vm::{VmManager, VmSession};
use rpm_forge::{logging, runs};

/// Build RPMs for several architectures in disposable VMs.
#[derive(Parser)]
#[command(name = "rpm-forge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory holding project.toml
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check host tools and emulation support
    Preflight {
        /// Architectures to check (default: all configured)
        #[arg(long = "arch")]
        archs: Vec<String>,
    },

    /// Build in one VM per architecture
    Build {
        /// Shell script run as root inside each guest
        #[arg(long)]
        script: PathBuf,

        /// Architectures to build (default: all configured)
        #[arg(long = "arch")]
        archs: Vec<String>,

        /// Skip remaining architectures after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Publish successful artifacts into this repository
        #[arg(long)]
        publish: Option<String>,
    },

    /// Mirror upstream repositories that have a sync section
    Sync {
        /// Repositories to synchronize (default: all with a sync section)
        repos: Vec<String>,
    },

    /// Publish the latest successful run of each architecture
    Publish {
        /// Target repository name under the annex
        #[arg(long)]
        repo: String,

        /// Architectures to publish (default: all configured)
        #[arg(long = "arch")]
        archs: Vec<String>,
    },

    /// Boot a guest for debugging, run a command or a shell, then stop it
    Vm {
        /// Architecture to boot (default: first configured)
        #[arg(long)]
        arch: Option<String>,

        /// Copy LOCAL:REMOTE into the guest once it is up
        #[arg(long = "copy-in", value_name = "LOCAL:REMOTE")]
        copy_in: Vec<String>,

        /// Copy REMOTE:LOCAL out of the guest before it stops
        #[arg(long = "copy-out", value_name = "REMOTE:LOCAL")]
        copy_out: Vec<String>,

        /// Command to run instead of an interactive shell
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Run package test scripts in a fresh guest per architecture
    Test {
        /// Test scripts; `*.local.sh` run on the host with `vm_cmd`
        #[arg(required = true)]
        scripts: Vec<PathBuf>,

        /// Architectures to test (default: all configured)
        #[arg(long = "arch")]
        archs: Vec<String>,

        /// Class name reported for the tests
        #[arg(long)]
        name: Option<String>,

        /// Write a JUnit report
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// List staged build runs
    Runs {
        /// Architectures to list (default: all configured)
        #[arg(long = "arch")]
        archs: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let outcome = match cli.command {
        Commands::Preflight { archs } => cmd_preflight(&cli.project, archs),
        Commands::Build {
            script,
            archs,
            fail_fast,
            publish,
        } => cmd_build(&cli.project, &script, archs, fail_fast, publish.as_deref()),
        Commands::Sync { repos } => cmd_sync(&cli.project, repos),
        Commands::Publish { repo, archs } => cmd_publish(&cli.project, &repo, archs),
        Commands::Vm {
            arch,
            copy_in,
            copy_out,
            command,
        } => cmd_vm(&cli.project, arch, &copy_in, &copy_out, &command),
        Commands::Test {
            scripts,
            archs,
            name,
            junit,
        } => cmd_test(&cli.project, &scripts, archs, name, junit.as_deref()),
        Commands::Runs { archs } => cmd_runs(&cli.project, archs),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(project: &Path) -> Result<BuildConfig> {
    BuildConfig::load(project)
        .with_context(|| format!("loading configuration from '{}'", project.display()))
}

fn select_archs(config: &BuildConfig, requested: Vec<String>) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config.arch.clone());
    }
    for arch in &requested {
        if !config.arch.contains(arch) {
            bail!("architecture '{arch}' is not configured (known: {})", config.arch.join(", "));
        }
    }
    Ok(requested)
}

fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, cancelling...");
        handler.cancel();
    }) {
        tracing::warn!("cannot install interrupt handler: {e}");
    }
    cancel
}

fn cmd_preflight(project: &Path, archs: Vec<String>) -> Result<bool> {
    let config = load_config(project)?;
    let archs = select_archs(&config, archs)?;
    preflight::check_host_tools(&archs)?;
    preflight::check_publish_tools(&config.createrepo, config.gpg.is_some())?;

    let host = SystemHost;
    let mut ok = true;
    println!("host: {} (kvm: {})", host.host_arch(), host.kvm_available());
    for arch in &archs {
        match host.emulation(arch) {
            Ok(()) if arch == &host.host_arch() => println!("  {arch}: native"),
            Ok(()) => println!("  {arch}: emulated"),
            Err(reason) => {
                ok = false;
                println!("  {arch}: unavailable ({reason})");
            }
        }
    }
    Ok(ok)
}

fn print_build_summary(results: &BTreeMap<String, BuildResult>) {
    println!();
    println!("Build summary:");
    for (arch, result) in results {
        let mode = if result.emulated { "emulated" } else { "native" };
        match &result.outcome {
            Ok(outcome) => println!(
                "  {arch:<8} ok      {mode:<8} {} package(s) in {}s",
                outcome.artifacts.len(),
                outcome.elapsed.as_secs()
            ),
            Err(e) => println!("  {arch:<8} {:<7} {mode:<8} {e}", e.kind()),
        }
        if let Some(dir) = &result.run_dir {
            println!("           {}", dir.display());
        }
    }
}

fn print_publish_summary(result: &PublishResult) {
    match &result.generation {
        Some(generation) => println!(
            "Published {} package(s) to {} ({})",
            result.published.len(),
            result.repo_dir.display(),
            generation.display()
        ),
        None => println!("Nothing published to {}", result.repo_dir.display()),
    }
    for err in &result.failed {
        println!("  {}: {err}", err.kind());
    }
}

fn publish_artifacts(config: &BuildConfig, repo: &str, artifacts: Vec<Artifact>) -> Result<bool> {
    let publisher = Publisher::from_config(Arc::new(SystemRunner), config);
    let result = publisher.publish(artifacts, &config.repository_dir(repo), config.gpg.as_ref())?;
    print_publish_summary(&result);
    Ok(result.is_complete())
}

fn cmd_build(
    project: &Path,
    script: &Path,
    archs: Vec<String>,
    fail_fast: bool,
    publish: Option<&str>,
) -> Result<bool> {
    let config = load_config(project)?;
    let archs = select_archs(&config, archs)?;
    preflight::check_host_tools(&archs)?;
    if publish.is_some() {
        preflight::check_publish_tools(&config.createrepo, config.gpg.is_some())?;
    }
    let script = fs::read_to_string(script)
        .with_context(|| format!("reading build script '{}'", script.display()))?;

    let manager = VmManager::new(Arc::new(SystemRunner), Arc::new(SystemHost))
        .with_cancel(cancel_on_interrupt());
    let policy = if fail_fast || config.fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::Continue
    };
    let coordinator = Coordinator::new(manager, script)?.with_policy(policy);
    println!("Run {}", coordinator.run_id());

    let results = coordinator.build_all(&config, &archs);
    print_build_summary(&results);
    let mut ok = results.values().all(BuildResult::is_success);

    if let Some(repo) = publish {
        let artifacts: Vec<Artifact> = results
            .values()
            .filter_map(|r| r.outcome.as_ref().ok())
            .flat_map(|outcome| outcome.artifacts.iter().cloned())
            .collect();
        ok &= publish_artifacts(&config, repo, artifacts)?;
    }
    Ok(ok)
}

fn cmd_sync(project: &Path, requested: Vec<String>) -> Result<bool> {
    let config = load_config(project)?;
    let output = config.sync_output();
    let cancel = cancel_on_interrupt();

    let selected: Vec<_> = config
        .repos
        .iter()
        .filter(|(name, _)| requested.is_empty() || requested.contains(*name))
        .collect();
    for name in &requested {
        if !config.repos.contains_key(name) {
            bail!("unknown repository '{name}'");
        }
    }

    let mut ok = true;
    for (name, repo) in selected {
        let Some(def) = &repo.sync else {
            if requested.contains(name) {
                bail!("repository '{name}' has no sync section");
            }
            continue;
        };
        if cancel.is_cancelled() {
            ok = false;
            break;
        }
        let sync = Synchronizer::for_repo(Arc::new(SystemRunner), &config, repo)?
            .with_cancel(cancel.clone());
        match sync.sync(name, def, &output) {
            Ok(report) => {
                println!(
                    "{name}: {} downloaded, {} unchanged, {} removed, {} failed{} ({}s)",
                    report.downloaded.len(),
                    report.unchanged,
                    report.removed.len(),
                    report.failed.len(),
                    if report.cancelled { ", cancelled" } else { "" },
                    report.elapsed.as_secs()
                );
                for err in &report.failed {
                    println!("  {err}");
                }
                ok &= report.is_complete();
            }
            Err(e) => {
                println!("{name}: {}: {e:#}", e.kind());
                ok = false;
            }
        }
    }
    Ok(ok)
}

fn cmd_publish(project: &Path, repo: &str, archs: Vec<String>) -> Result<bool> {
    let config = load_config(project)?;
    let archs = select_archs(&config, archs)?;
    preflight::check_publish_tools(&config.createrepo, config.gpg.is_some())?;

    let mut artifacts = Vec::new();
    for arch in &archs {
        match runs::latest_successful_run(&config.staging_dir(arch))? {
            Some(run) => {
                println!("{arch}: run {} ({} package(s))", run.run_id, run.artifacts.len());
                artifacts.extend(run.artifacts);
            }
            None => println!("{arch}: no successful run"),
        }
    }
    publish_artifacts(&config, repo, artifacts)
}

/// `a:b` split on the first colon.
fn copy_pair(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once(':') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => Ok((from, to)),
        _ => bail!("invalid copy specification '{spec}', expected SOURCE:DEST"),
    }
}

fn start_session(config: &BuildConfig, arch: &str, manager: &VmManager) -> Result<VmSession> {
    let request = coordinator::session_request(
        config,
        arch,
        manager.host(),
        config.staging_dir(arch),
    )?;
    println!("Starting {arch} VM...");
    let session = manager.start(&request)?;
    println!("{arch} VM ready on port {}", session.port());
    Ok(session)
}

fn cmd_vm(
    project: &Path,
    arch: Option<String>,
    copy_in: &[String],
    copy_out: &[String],
    command: &[String],
) -> Result<bool> {
    let config = load_config(project)?;
    let arch = match arch {
        Some(arch) => select_archs(&config, vec![arch])?.remove(0),
        None => config
            .arch
            .first()
            .cloned()
            .context("no architecture configured")?,
    };
    preflight::check_host_tools(std::slice::from_ref(&arch))?;

    let manager = VmManager::new(Arc::new(SystemRunner), Arc::new(SystemHost))
        .with_cancel(cancel_on_interrupt());
    let mut session = start_session(&config, &arch, &manager)?;

    for spec in copy_in {
        let (local, remote) = copy_pair(spec)?;
        session.upload(Path::new(local), remote)?;
    }
    let code = if command.is_empty() {
        session.connect()?
    } else {
        session
            .run_remote(&command.join(" "), None, &mut |line| println!("{line}"))?
            .code
    };
    for spec in copy_out {
        let (remote, local) = copy_pair(spec)?;
        session.download(remote, Path::new(local))?;
    }

    session.teardown();
    println!("{arch} VM stopped");
    Ok(code == 0)
}

fn cmd_test(
    project: &Path,
    scripts: &[PathBuf],
    archs: Vec<String>,
    name: Option<String>,
    junit: Option<&Path>,
) -> Result<bool> {
    let config = load_config(project)?;
    let archs = select_archs(&config, archs)?;
    preflight::check_host_tools(&archs)?;
    let scripts = scripts
        .iter()
        .map(|path| TestScript::from_path(path))
        .collect::<Result<Vec<_>>>()?;
    let classname = name.or_else(|| {
        config
            .project_dir
            .as_deref()
            .and_then(|dir| dir.canonicalize().ok())
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
    });

    let manager = VmManager::new(Arc::new(SystemRunner), Arc::new(SystemHost))
        .with_cancel(cancel_on_interrupt());
    let timeout = Duration::from_secs(config.build_timeout_secs);
    let mut results = TestResults::new("test");
    let mut ok = true;
    for arch in &archs {
        let outcome = start_session(&config, arch, &manager).and_then(|mut session| {
            let run = testsuite::run_tests(
                &session,
                &scripts,
                classname.as_deref(),
                timeout,
                &mut results,
            );
            session.teardown();
            Ok(run?)
        });
        if let Err(e) = outcome {
            println!("{arch}: {e:#}");
            ok = false;
        }
    }

    println!();
    print!("{}", results.summary());
    if let Some(path) = junit {
        results.write_junit(path)?;
        println!("JUnit report written to {}", path.display());
    }
    Ok(ok && results.is_success())
}

fn cmd_runs(project: &Path, archs: Vec<String>) -> Result<bool> {
    let config = load_config(project)?;
    for arch in select_archs(&config, archs)? {
        let mut records = runs::load_runs(&config.staging_dir(&arch))?;
        records.sort_by(|a, b| a.created_at_utc.cmp(&b.created_at_utc));
        println!("{arch}:");
        for run in records {
            println!(
                "  {}  {:<9} {}  {} package(s){}",
                run.created_at_utc,
                format!("{:?}", run.status).to_lowercase(),
                run.run_id,
                run.artifacts.len(),
                run.error_kind.map(|k| format!("  [{k}]")).unwrap_or_default()
            );
        }
    }
    Ok(true)
}
