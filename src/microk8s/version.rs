//! MicroK8s snap channel table and version parsing
//!
//! Upgrades step through a fixed ordered table of supported channels one
//! release at a time. The installed channel is read from `snap list`
//! output; snaps tracking `latest/stable` are normalized to the pinned
//! channel derived from the installed version.

use crate::{Error, Result};

/// Supported MicroK8s channels, oldest to newest
///
/// An upgrade moves a cluster to the entry after its current channel; a
/// cluster already on the newest entry stays put.
pub const MICROK8S_CHANNELS: &[&str] = &[
    "1.24/stable",
    "1.25/stable",
    "1.26/stable",
    "1.27/stable",
    "1.28/stable",
    "1.29/stable",
    "1.30/stable",
    "1.31/stable",
    "1.32/stable",
];

/// Newest supported channel, used as the default for new clusters
pub fn latest_channel() -> &'static str {
    MICROK8S_CHANNELS[MICROK8S_CHANNELS.len() - 1]
}

/// The channel after `current` in the upgrade order
///
/// Returns `None` when `current` is already the newest supported channel
/// or is not in the table at all.
pub fn next_channel(current: &str) -> Option<&'static str> {
    let idx = MICROK8S_CHANNELS.iter().position(|c| *c == current)?;
    MICROK8S_CHANNELS.get(idx + 1).copied()
}

/// Parse the installed MicroK8s channel from `snap list` output
///
/// Expected row shape:
/// `microk8s  v1.24.13  5137  1.24/stable  canonical  classic`
///
/// A `latest/stable` tracking entry is rewritten to `<major>.<minor>/stable`
/// derived from the version column, so upgrade stepping always works on a
/// pinned channel.
pub fn parse_snap_installed_channel(output: &str) -> Result<String> {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"microk8s") || fields.len() < 4 {
            continue;
        }
        let version = fields[1];
        let tracking = fields[3];

        if tracking == "latest/stable" {
            return channel_from_version(version).ok_or_else(|| {
                Error::provider(format!(
                    "cannot derive channel from installed version '{}'",
                    version
                ))
            });
        }
        return Ok(tracking.to_string());
    }
    Err(Error::provider(
        "microk8s not found in snap list output".to_string(),
    ))
}

/// Derive a pinned channel from a version string like `v1.24.13`
fn channel_from_version(version: &str) -> Option<String> {
    let (major, minor) = parse_major_minor(version)?;
    Some(format!("{}.{}/stable", major, minor))
}

/// Extract `(major, minor)` from a version or channel string
///
/// Accepts `v1.24.13`, `1.24.13`, `1.24/stable` and bare `1.24`.
pub fn parse_major_minor(s: &str) -> Option<(u32, u32)> {
    let trimmed = s.trim_start_matches('v');
    let trimmed = trimmed.split('/').next()?;
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
