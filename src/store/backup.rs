//! Online backup.
//!
//! A backup is a copy of the repository laid out exactly like one: a
//! directory per database holding its node files and scheme, plus a `log`
//! directory. It is written under `<root>/<bsn>.incomplete` and renamed to
//! `<root>/<bsn>` once complete, so opening an environment on `<root>/<bsn>`
//! restores it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::database::Database;
use super::environment::Shared;
use super::node::NodeName;
use super::scheme::SCHEME_FILE;
use super::sequence::Sequence;
use crate::error::Result;
use crate::wal::LOG_DIR;

const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Copies every database and the log into `<root>/<bsn>`.
///
/// The commit lock is held for the whole copy: commits wait, and log garbage
/// collection cannot drop a file whose rows only the copied log holds.
pub(crate) fn run(
    root: &Path,
    bsn: u64,
    shared: &Shared,
    databases: &[Arc<Database>],
) -> Result<PathBuf> {
    let incomplete = root.join(format!("{}{}", bsn, INCOMPLETE_SUFFIX));
    let target = root.join(bsn.to_string());
    if incomplete.exists() {
        fs::remove_dir_all(&incomplete)?;
    }
    fs::create_dir_all(&incomplete)?;

    let _commit = shared.seq.commit_lock()?;
    let mut copied = Vec::new();
    for db in databases {
        let dir = incomplete.join(db.name());
        fs::create_dir_all(&dir)?;
        for node in db.tree().nodes()? {
            node.file()
                .copy_to(&NodeName::Live { id: node.id() }.path(&dir))?;
            copied.push(node);
        }
        fs::copy(db.tree().dir().join(SCHEME_FILE), dir.join(SCHEME_FILE))?;
    }

    shared.log.sync()?;
    let log_dir = incomplete.join(LOG_DIR);
    fs::create_dir_all(&log_dir)?;
    let mut logs = 0;
    for path in shared.log.files()? {
        if let Some(name) = path.file_name() {
            fs::copy(&path, log_dir.join(name))?;
            logs += 1;
        }
    }

    fs::rename(&incomplete, &target)?;
    for node in &copied {
        node.set_backup(bsn);
    }
    shared.seq.observe_bsn(bsn);

    tracing::info!(
        bsn,
        nodes = copied.len(),
        logs,
        path = %target.display(),
        "Backup complete"
    );
    Ok(target)
}

/// Removes unfinished backups under `root` and continues numbering after
/// the newest complete one.
pub(crate) fn recover(root: &Path, seq: &Sequence) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(bsn) = name.parse::<u64>() {
            seq.observe_bsn(bsn);
        } else if let Some(bsn) = name.strip_suffix(INCOMPLETE_SUFFIX) {
            if bsn.parse::<u64>().is_ok() {
                tracing::warn!(path = %entry.path().display(), "Removing unfinished backup");
                fs::remove_dir_all(entry.path())?;
            }
        }
    }
    Ok(())
}
