//! Directory mirroring with `lftp`.
//!
//! lftp applies the include/exclude patterns and deletions itself; the
//! manifest and report are derived by comparing the tree before and after.

use anyhow::{bail, Result};

use super::manifest::scan_tree;
use super::SyncRun;
use crate::process::{Cmd, StreamOutcome};

pub fn mirror_script(run: &SyncRun<'_>) -> String {
    let mut script = String::from("set ssl:verify-certificate off; mirror --no-empty-dirs");
    for pattern in &run.def.include {
        script.push_str(&format!(" --include={pattern}"));
    }
    for pattern in &run.def.exclude {
        script.push_str(&format!(" --exclude={pattern}"));
    }
    script.push_str(&format!(
        " --delete --log {} {} {}; quit",
        run.log.path().display(),
        run.source.path,
        run.output.display()
    ));
    script
}

pub fn run(run: &mut SyncRun<'_>) -> Result<()> {
    let before = scan_tree(&run.output)?;

    let mut cmd = Cmd::new("lftp")
        .arg(&run.source.base)
        .arg("-e")
        .arg(mirror_script(run));
    for (key, value) in run.sync.proxy_env() {
        cmd = cmd.env(key, value);
    }
    tracing::debug!(cmd = %cmd.command_line(), "running synchronization command");

    let repo = run.repo;
    let outcome = run.sync.runner().run_streaming(&cmd, &run.sync.cancel, &mut |line| {
        tracing::debug!(target: "rpm_forge::lftp", repo, "{line}");
    })?;

    let after = scan_tree(&run.output)?;
    for (rel, record) in &after {
        if before.get(rel) != Some(record) {
            run.report.downloaded.push(rel.clone());
        } else {
            run.report.unchanged += 1;
        }
    }
    for rel in before.keys().filter(|rel| !after.contains_key(*rel)) {
        run.report.removed.push(run.output.join(rel));
    }

    match outcome {
        StreamOutcome::Exited(result) if result.success() => {
            run.manifest.files = after;
            Ok(())
        }
        StreamOutcome::Exited(result) => bail!(
            "Error while running command: {}: exit code: {}",
            cmd.command_line(),
            result.code
        ),
        StreamOutcome::Cancelled => {
            // Only files lftp has fully written are recorded.
            run.report.cancelled = true;
            run.manifest.files = after
                .into_iter()
                .filter(|(rel, _)| !rel.ends_with(".lftp-pget-status"))
                .collect();
            Ok(())
        }
        StreamOutcome::TimedOut => bail!("lftp timed out mirroring {}", run.source.url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncDef, SyncMethod};
    use crate::process::SystemRunner;
    use crate::sync::fetch::HttpFetcher;
    use crate::sync::{ActionLog, PathFilter, SourceUrl, SyncManifest, SyncReport, Synchronizer};
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn script_passes_filters_through() {
        let sync = Synchronizer::new(
            Arc::new(SystemRunner),
            Arc::new(HttpFetcher::new(None, None).unwrap()),
        );
        let def = SyncDef {
            source: "https://m/rocky/9/".into(),
            method: SyncMethod::Lftp,
            subdir: None,
            include: vec!["^x86_64".into()],
            exclude: vec!["/kickstart/".into()],
        };
        let run = SyncRun {
            sync: &sync,
            repo: "rocky",
            def: &def,
            source: SourceUrl::parse(&def.source, None).unwrap(),
            output_root: PathBuf::from("/mirror"),
            output: PathBuf::from("/mirror/rocky"),
            filter: PathFilter::default(),
            log: ActionLog::new(std::path::Path::new("/mirror"), "rocky"),
            previous: SyncManifest::default(),
            manifest: SyncManifest::default(),
            report: SyncReport::default(),
        };
        let script = mirror_script(&run);
        assert!(script.starts_with("set ssl:verify-certificate off; mirror --no-empty-dirs"));
        assert!(script.contains("--include=^x86_64 --exclude=/kickstart/ --delete --log /mirror/sync_rocky_"));
        assert!(script.ends_with(" /rocky/9/ /mirror/rocky; quit"));
    }
}
