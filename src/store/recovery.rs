//! Startup recovery.
//!
//! Recovery runs in three phases:
//!
//! 1. Schemes. Every registered database's scheme file is loaded (or written
//!    for a new database) so database ids are stable across restarts.
//! 2. Node files. Leftovers of interrupted compactions are reconciled: an
//!    `.incomplete` file is removed, a `.seal` file is removed when its parent
//!    is still live and promoted to `<id>.db` otherwise, a `.gc` file is
//!    removed. The remaining `<id>.db` files form the tree.
//! 3. Log replay. Every log file is replayed in order; a row is applied only
//!    when its lsn is above the lsn-max of the node that owns its key, since
//!    anything at or below that is already in the node file.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::compression::Compression;
use super::database::Database;
use super::environment::Shared;
use super::node::{Node, NodeName};
use super::scheme::Scheme;
use super::sequence::Sequence;
use super::tree::{Tree, TreeOptions};
use crate::config::{DatabaseConfig, EnvConfig};
use crate::error::Result;
use crate::wal::recovery::replay_logs;
use crate::wal::LOG_DIR;

/// Recovers every registered database and replays the log into them.
pub(crate) fn recover(
    config: &EnvConfig,
    registry: &[(String, DatabaseConfig)],
    shared: &Arc<Shared>,
) -> Result<Vec<Arc<Database>>> {
    let seq = &shared.seq;

    // Existing ids are observed before any new database takes one.
    let mut found = Vec::with_capacity(registry.len());
    for (name, db_config) in registry {
        let dir = config.dir.join(name);
        fs::create_dir_all(&dir)?;
        let scheme = Scheme::load(&dir)?;
        if let Some(scheme) = &scheme {
            scheme.check(&db_config.schema)?;
            seq.observe_dsn(scheme.dsn);
        }
        found.push((name, db_config, dir, scheme));
    }

    let mut databases = Vec::with_capacity(found.len());
    for (name, db_config, dir, scheme) in found {
        let scheme = match scheme {
            Some(scheme) => scheme,
            None => {
                let scheme = Scheme::from_config(seq.next_dsn(), name, db_config);
                scheme.save(&dir)?;
                tracing::info!(db = %name, dsn = scheme.dsn, "Created database");
                scheme
            }
        };

        let options = TreeOptions {
            compression: Compression::parse(&scheme.compression)?,
            mmap: db_config.mmap,
            verify: db_config.compaction.checksum,
        };
        let tree = Tree::new(dir.clone(), options);
        let nodes = open_nodes(&tree, seq)?;
        tree.load(nodes)?;
        if tree.is_empty() {
            let node = tree.create_empty_node(0, seq.next_nsn(), 0)?;
            tree.load(vec![node])?;
        }
        for node in tree.nodes()? {
            seq.publish_lsn(node.lsn_max());
        }

        tracing::debug!(db = %name, dsn = scheme.dsn, nodes = tree.len(), "Loaded tree");
        databases.push(Arc::new(Database::new(
            name.clone(),
            db_config.clone(),
            scheme,
            tree,
            Arc::clone(shared),
        )));
    }

    replay(&config.dir.join(LOG_DIR), &databases, shared)?;
    Ok(databases)
}

/// Reconciles the node files in a tree directory and opens the live ones.
fn open_nodes(tree: &Tree, seq: &Sequence) -> Result<Vec<Arc<Node>>> {
    let dir = tree.dir();
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str().and_then(NodeName::parse) {
            names.push(name);
        }
    }

    let live: HashSet<u64> = names
        .iter()
        .filter_map(|name| match name {
            NodeName::Live { id } => Some(*id),
            _ => None,
        })
        .collect();

    let mut ids = Vec::new();
    for name in names {
        seq.observe_nsn(name.id());
        match name {
            NodeName::Live { id } => ids.push(id),
            NodeName::Incomplete { parent, .. } => {
                seq.observe_nsn(parent);
                remove(&name.path(dir), "incomplete node")?;
            }
            NodeName::Gc { .. } => remove(&name.path(dir), "retired node")?,
            NodeName::Seal { parent, id } => {
                seq.observe_nsn(parent);
                if live.contains(&parent) {
                    remove(&name.path(dir), "sealed node of unfinished compaction")?;
                } else {
                    let target = NodeName::Live { id }.path(dir);
                    fs::rename(name.path(dir), &target)?;
                    tracing::info!(node = id, parent, "Promoted sealed node");
                    ids.push(id);
                }
            }
        }
    }

    ids.sort_unstable();
    ids.into_iter()
        .map(|id| Ok(Arc::new(tree.open_node(id, NodeName::Live { id }.path(dir))?)))
        .collect()
}

fn remove(path: &Path, what: &str) -> Result<()> {
    tracing::warn!(path = %path.display(), "Removing {}", what);
    fs::remove_file(path)?;
    Ok(())
}

/// Replays every log file into the trees and hands the files to the log
/// pool, which then starts a fresh file.
fn replay(dir: &Path, databases: &[Arc<Database>], shared: &Shared) -> Result<()> {
    let by_dsn: HashMap<u32, &Arc<Database>> = databases.iter().map(|db| (db.dsn(), db)).collect();
    let mut applied = 0u64;
    let mut skipped = 0u64;

    let replayed = replay_logs(dir, |batch| {
        for record in &batch.records {
            let Some(db) = by_dsn.get(&record.dsn) else {
                skipped += 1;
                continue;
            };
            let node = db.tree().route(&record.key)?;
            if batch.lsn <= node.lsn_max() {
                skipped += 1;
                continue;
            }
            node.set(record.to_value(batch.lsn))?;
            applied += 1;
        }
        shared.seq.publish_lsn(batch.lsn);
        Ok(())
    })?;

    let files = replayed.len();
    for log in replayed {
        shared.log.attach(log.lfsn, log.path, log.lsn_max)?;
    }
    shared.log.rotate()?;

    tracing::info!(
        files,
        applied,
        skipped,
        lsn = shared.seq.lsn(),
        "Log replay complete"
    );
    Ok(())
}
