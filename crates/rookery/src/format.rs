//! Bookie formatting: wipe journal, ledger, and index data.

use std::io::BufRead;
use std::path::Path;

use rook_error::Result;
use rook_types::{BookieConfig, Cx};
use rook_vfs::Vfs;
use tracing::{error, info};

/// Wipe all bookie data for this configuration.
///
/// Refuses to destroy a non-empty journal directory unless `force` is
/// set or the operator confirms interactively. Returns whether the
/// format completed.
pub fn format<V: Vfs>(vfs: &V, cx: &Cx, cfg: &BookieConfig, interactive: bool, force: bool) -> bool {
    let has_data = match dir_non_empty(vfs, cx, &cfg.journal_dir) {
        Ok(v) => v,
        Err(err) => {
            error!(error = %err, "cannot inspect journal directory");
            return false;
        }
    };
    if has_data {
        let confirmed = if interactive {
            confirm_prompt("Are you sure to format the bookie data?")
        } else {
            force
        };
        if !confirmed {
            error!("bookie format aborted");
            return false;
        }
    }

    if let Err(err) = clean_dir(vfs, cx, &cfg.journal_dir) {
        error!(error = %err, dir = %cfg.journal_dir.display(), "formatting journal directory failed");
        return false;
    }
    for dir in &cfg.ledger_dirs {
        if let Err(err) = clean_dir(vfs, cx, dir) {
            error!(error = %err, dir = %dir.display(), "formatting ledger directory failed");
            return false;
        }
    }
    info!("bookie format completed");
    true
}

fn dir_non_empty<V: Vfs>(vfs: &V, cx: &Cx, dir: &Path) -> Result<bool> {
    if !vfs.exists(cx, dir)? {
        return Ok(false);
    }
    Ok(!vfs.read_dir(cx, dir)?.is_empty())
}

/// Delete every file under `dir`, recursively, leaving directories.
fn clean_dir<V: Vfs>(vfs: &V, cx: &Cx, dir: &Path) -> Result<()> {
    if !vfs.exists(cx, dir)? {
        vfs.create_dir_all(cx, dir)?;
        return Ok(());
    }
    for path in vfs.read_dir(cx, dir)? {
        if vfs.read_dir(cx, &path).is_ok_and(|children| !children.is_empty()) {
            clean_dir(vfs, cx, &path)?;
        } else if vfs.delete(cx, &path).is_err() {
            // Empty subdirectory: nothing to delete through the VFS.
            continue;
        }
    }
    Ok(())
}

fn confirm_prompt(question: &str) -> bool {
    eprintln!("{question} (y/n)");
    let stdin = std::io::stdin();
    let mut line = String::new();
    if stdin.lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}
