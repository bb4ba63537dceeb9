//! Periodic new-version discovery.
//!
//! At every tick of the (adjustable) update interval the configured updates
//! directory is scanned for release files named `vigil-<version>`. When one
//! newer than the running version is found, every validated client gets a
//! `NewVersionAvailable` push and is expected to acknowledge with the same
//! path.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use vigil_core::wire::{self, messages, MessageType};

use crate::server::Invigilator;

/// Runs the update check loop; never returns.
pub async fn run(state: Arc<Invigilator>) {
    loop {
        let interval = *state.update_interval.lock().unwrap();
        tokio::time::sleep(interval).await;

        let Some(updates_dir) = state.config.updates_dir.as_deref() else {
            continue;
        };
        match discover_new_version(updates_dir, env!("CARGO_PKG_VERSION")) {
            Ok(Some(path)) => notify_clients(&state, &path),
            Ok(None) => {}
            Err(error) => warn!(%error, "update check failed"),
        }
    }
}

fn notify_clients(state: &Arc<Invigilator>, path: &Path) {
    let frame = wire::wrap_message(
        MessageType::NewVersionAvailable,
        &messages::NewVersionAvailable {
            new_version_filepath: path.display().to_string(),
        },
    );
    let clients = state.connections.validated_connections();
    info!(path = %path.display(), clients = clients.len(), "new version available");
    for client in clients {
        if !state.registry.send_to(client, frame.clone()) {
            warn!(client, "failed to push new-version notification");
        }
    }
}

/// Returns the newest release file in `dir` that is newer than `current`.
///
/// # Errors
///
/// Returns an error when the directory cannot be read.
pub fn discover_new_version(dir: &Path, current: &str) -> io::Result<Option<PathBuf>> {
    let Some(current) = parse_version(current) else {
        return Ok(None);
    };
    let mut newest: Option<(Version, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(version) = name.strip_prefix("vigil-").and_then(parse_version) else {
            continue;
        };
        if version > current && newest.as_ref().is_none_or(|(best, _)| version > *best) {
            newest = Some((version, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

type Version = (u64, u64, u64);

fn parse_version(text: &str) -> Option<Version> {
    let mut parts = text.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn versions_parse_and_order() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("0.1.0"), Some((0, 1, 0)));
        assert!(parse_version("1.2").is_none());
        assert!(parse_version("1.2.3.4").is_none());
        assert!(parse_version("release").is_none());
        assert!((1, 0, 0) > (0, 99, 99));
    }

    #[test]
    fn newest_newer_release_wins() {
        let dir = TempDir::new().unwrap();
        for name in ["vigil-0.0.9", "vigil-0.2.0", "vigil-0.3.1", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"release").unwrap();
        }

        let found = discover_new_version(dir.path(), "0.1.0").unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "vigil-0.3.1");
    }

    #[test]
    fn nothing_newer_yields_none() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("vigil-0.1.0"), b"release").unwrap();
        assert!(discover_new_version(dir.path(), "0.1.0").unwrap().is_none());
        assert!(discover_new_version(dir.path(), "9.0.0").unwrap().is_none());
    }
}
