//! External command execution and parsers shared across adapters

use crate::error::PlatformError;
use crate::models::DiskSample;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Pseudo filesystems that never hold workload data
const IGNORED_FILESYSTEMS: &[&str] = &[
    "tmpfs", "devtmpfs", "devfs", "proc", "sysfs", "cgroup", "cgroup2", "overlay", "squashfs",
    "map", "none", "udev",
];

/// Run a command and return its stdout.
///
/// A missing binary is reported as unsupported rather than failed, so the
/// caller can tell "not available here" from "broke this time".
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, PlatformError> {
    let rendered = if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(PlatformError::Timeout {
                command: rendered,
                timeout,
            })
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PlatformError::Unsupported {
                platform: std::env::consts::OS.to_string(),
                what: rendered,
            })
        }
        Ok(Err(e)) => return Err(PlatformError::command_failed(rendered, e.to_string())),
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::command_failed(
            rendered,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `df -k` / `df -kP` output.
///
/// Handles the non-POSIX layout where a long device name pushes the numbers
/// onto the following line.
pub fn parse_df(content: &str) -> Result<Vec<DiskSample>, PlatformError> {
    let mut disks = Vec::new();
    let mut pending_fs: Option<String> = None;

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        let (filesystem, rest) = match pending_fs.take() {
            Some(fs) => (fs, &parts[..]),
            None if parts.len() == 1 => {
                pending_fs = Some(parts[0].to_string());
                continue;
            }
            None => (parts[0].to_string(), &parts[1..]),
        };

        // total used available capacity mount...
        if rest.len() < 5 {
            continue;
        }
        let total_kb = match rest[0].parse::<u64>() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let used_kb = rest[1].parse::<u64>().unwrap_or(0);
        let free_kb = rest[2].parse::<u64>().unwrap_or(0);
        // macOS `df -k` inserts inode columns before the mount point
        let mount_point = rest
            .iter()
            .skip(4)
            .find(|p| p.starts_with('/'))
            .map(|p| p.to_string())
            .unwrap_or_else(|| rest[rest.len() - 1].to_string());

        if total_kb == 0 || IGNORED_FILESYSTEMS.contains(&filesystem.as_str()) {
            continue;
        }

        disks.push(DiskSample {
            total_kb,
            used_kb,
            free_kb,
            percent: super::percent_of(used_kb, used_kb + free_kb),
            filesystem,
            mount_point,
        });
    }

    if disks.is_empty() {
        return Err(PlatformError::parse("df", "no filesystems found"));
    }
    Ok(disks)
}
