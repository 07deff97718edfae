//! Mirroring of EPEL style trees from their `fullfiletimelist-epel` index.

use anyhow::{Context, Result};
use std::fs;
use tempfile::NamedTempFile;

use super::{fetch, RemoteFile, SourceUrl, SyncRun};

/// Public root of the mirror, prefixed to every index path.
pub const PUB_ROOT: &str = "/pub/epel";
pub const INDEX_NAME: &str = "fullfiletimelist-epel";

/// Parse one index line into a file under `source`.
///
/// Lines are `timestamp \t type \t size \t path`; anything else (section
/// headers, directories, symlinks) is skipped.
pub fn parse_index_line(line: &str, source: &SourceUrl) -> Option<RemoteFile> {
    let mut fields = line.split('\t');
    let (timestamp, ftype, size, path) =
        (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
    if fields.next().is_some() || ftype != "f" {
        return None;
    }
    let timestamp = timestamp.trim().parse::<i64>().ok()?;

    let abspath = format!("{PUB_ROOT}/{}", path.trim());
    let relpath = abspath
        .strip_prefix(source.path.as_str())?
        .trim_start_matches('/')
        .to_string();
    if relpath.is_empty() {
        return None;
    }
    Some(RemoteFile {
        url: format!("{}{abspath}", source.base),
        relpath,
        size: size.trim().parse().ok(),
        timestamp: Some(timestamp),
    })
}

pub fn parse_index(content: &str, source: &SourceUrl) -> Vec<RemoteFile> {
    content
        .lines()
        .filter_map(|line| parse_index_line(line.trim_end_matches('\r'), source))
        .collect()
}

pub fn run(run: &mut SyncRun<'_>) -> Result<()> {
    let index = NamedTempFile::with_prefix("rpm-forge-epel-filelist-")
        .context("creating index file")?;
    let index_url = format!("{}{PUB_ROOT}/{INDEX_NAME}", run.source.base);
    tracing::debug!(url = %index_url, "downloading EPEL files index");
    fetch::fetch_with_retry(
        run.sync.fetcher(),
        &index_url,
        index.path(),
        run.sync.retry,
        &run.sync.cancel,
    )?;

    let content = fs::read_to_string(index.path())
        .with_context(|| format!("reading {}", index.path().display()))?;
    let files = parse_index(&content, &run.source);
    tracing::info!(repo = run.repo, files = files.len(), "index parsed");

    let indexed = run.transfer_indexed(&files, false)?;
    if !run.report.cancelled {
        run.clean_output(&indexed, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceUrl {
        SourceUrl::parse("https://dl.example.org/pub/epel/9/Everything", None).unwrap()
    }

    #[test]
    fn keeps_files_under_source() {
        let line = "1700000000\tf\t1234\t9/Everything/x86_64/Packages/a/a-1.rpm";
        let file = parse_index_line(line, &source()).unwrap();
        assert_eq!(file.relpath, "x86_64/Packages/a/a-1.rpm");
        assert_eq!(
            file.url,
            "https://dl.example.org/pub/epel/9/Everything/x86_64/Packages/a/a-1.rpm"
        );
        assert_eq!(file.size, Some(1234));
        assert_eq!(file.timestamp, Some(1700000000));
    }

    #[test]
    fn skips_other_entries() {
        let src = source();
        assert!(parse_index_line("[Files]", &src).is_none());
        assert!(parse_index_line("1700000000\td\t0\t9/Everything/x86_64", &src).is_none());
        assert!(parse_index_line("1700000000\tl\t0\t9/Everything/link", &src).is_none());
        assert!(parse_index_line("1700000000\tf\t1\t8/Everything/x86_64/a.rpm", &src).is_none());
        assert!(parse_index_line("not-a-number\tf\t1\t9/Everything/a.rpm", &src).is_none());
    }

    #[test]
    fn parses_whole_index() {
        let index = "[Version]\n2\n\n[Files]\n\
                     1700000000\tf\t10\t9/Everything/x86_64/a.rpm\n\
                     1700000001\tf\t20\t9/Everything/aarch64/b.rpm\r\n\
                     1700000002\tf\t30\t7/x86_64/c.rpm\n";
        let files = parse_index(index, &source());
        let rels: Vec<_> = files.iter().map(|f| f.relpath.as_str()).collect();
        assert_eq!(rels, ["x86_64/a.rpm", "aarch64/b.rpm"]);
    }
}
