use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use super::wal::{parse_log_name, Batch, ReplayIterator};
use crate::error::{Error, Result};

/// A log file found on disk and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedLog {
    pub lfsn: u64,
    pub path: PathBuf,
    pub lsn_max: u64,
    pub batches: u64,
}

/// Log files in `dir`, oldest first.
pub fn list_logs(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    std::fs::create_dir_all(dir)?;

    let mut logs: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let lfsn = parse_log_name(entry.file_name().to_str()?)?;
            Some((lfsn, entry.path()))
        })
        .collect();

    logs.sort_by_key(|(lfsn, _)| *lfsn);
    Ok(logs)
}

/// Replays every log file in `dir` in order, handing each complete commit
/// to `apply`. A torn tail is cut off the newest file so it replays cleanly
/// next time; in any older file it is corruption, since later files follow
/// it.
pub fn replay_logs<F>(dir: &Path, mut apply: F) -> Result<Vec<ReplayedLog>>
where
    F: FnMut(Batch) -> Result<()>,
{
    let logs = list_logs(dir)?;
    let newest = logs.last().map(|(lfsn, _)| *lfsn);
    let mut replayed = Vec::new();
    for (lfsn, path) in logs {
        let mut iter = ReplayIterator::open(&path)?;
        let mut lsn_max = 0;
        let mut batches = 0;
        for batch in iter.by_ref() {
            let batch = batch?;
            lsn_max = lsn_max.max(batch.lsn);
            batches += 1;
            apply(batch)?;
        }
        if iter.truncated() && Some(lfsn) != newest {
            return Err(Error::CorruptedWal(format!(
                "{} ends early at offset {} but newer logs follow",
                path.display(),
                iter.offset()
            )));
        }
        if iter.truncated() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(iter.offset())?;
            file.sync_all()?;
        }

        tracing::debug!(lfsn, batches, lsn_max, "Replayed log file");
        replayed.push(ReplayedLog {
            lfsn,
            path,
            lsn_max,
            batches,
        });
    }
    Ok(replayed)
}
