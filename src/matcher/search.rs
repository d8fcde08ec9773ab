use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("ripgrep is not available: {0}")]
    Unavailable(io::Error),

    #[error("ripgrep failed: {0}")]
    Failed(String),
}

/// Logs among `paths` containing at least one of `fragments`, found with ripgrep
pub fn files_containing_any(
    fragments: &[String],
    paths: &[PathBuf],
    threads: usize,
) -> Result<HashSet<PathBuf>, SearchError> {
    if fragments.is_empty() || paths.is_empty() {
        return Ok(HashSet::new());
    }

    let mut command = Command::new("rg");
    command
        .args([
            "--fixed-strings",
            "--files-with-matches",
            "--no-messages",
            "--no-config",
            "--no-ignore",
            "--hidden",
        ])
        .arg("--threads")
        .arg(threads.max(1).to_string());
    for fragment in fragments {
        command.arg("-e").arg(fragment);
    }
    command
        .arg("--")
        .args(paths)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());

    let output = command.output().map_err(SearchError::Unavailable)?;

    // 0 = matches, 1 = no matches, 2 = error (a file may have vanished; output still valid)
    match output.status.code() {
        Some(0) | Some(2) => {}
        Some(1) => return Ok(HashSet::new()),
        _ => {
            return Err(SearchError::Failed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// The trailing `tail_bytes` of a file, lossily decoded
pub fn read_tail(path: &Path, tail_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(tail_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(tail_bytes).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
