use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::policy::PathPolicy;

/// Delete files under the output root whose URL is not reachable from the
/// entry seed. Paths the policy rejects (hidden files, deploy artifacts,
/// the ignored list) are left alone. Returns the number of files removed;
/// individual failures are logged and never fail the run.
pub fn sweep(policy: &PathPolicy, reachable: &HashSet<String>) -> usize {
    let root = policy.root();
    let mut files = Vec::new();
    collect_files(root, &mut files);

    let mut deleted = 0;
    for file in files {
        let Some(url) = policy.path_to_url(&file) else {
            continue;
        };
        if reachable.contains(url.as_str()) {
            continue;
        }

        match fs::remove_file(&file) {
            Ok(()) => {
                info!(path = %file.display(), url = %url, "deleted unreachable file");
                deleted += 1;
                if let Some(parent) = file.parent() {
                    prune_empty_dirs(parent, root);
                }
            }
            Err(e) => {
                warn!(path = %file.display(), error = %e, "failed to delete unreachable file");
            }
        }
    }

    if deleted > 0 {
        debug!(deleted, "reachability sweep finished");
    }
    deleted
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// Walk parents upward, removing directories that became empty, stopping at
/// the output root.
fn prune_empty_dirs(start: &Path, root: &Path) {
    let mut dir = start.to_path_buf();
    while dir != root && dir.starts_with(root) {
        let empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !empty {
            break;
        }
        if let Err(e) = fs::remove_dir(&dir) {
            warn!(path = %dir.display(), error = %e, "failed to remove empty directory");
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}
