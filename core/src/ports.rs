//! Listening-port discovery, platform-dispatched: `ss` on Linux, `lsof` on
//! macOS, PowerShell on Windows. Output is parsed into a deduplicated,
//! ascending list of valid ports.

use tokio::process::Command;

use crate::error::{Result, WorkbenchError};

#[cfg(any(target_os = "linux", target_os = "android"))]
const LIST_COMMAND: &str =
    "ss -ntlpH | awk '{print $5}' | awk -F: '{print $NF}' | sort -n | uniq";

#[cfg(target_os = "macos")]
const LIST_COMMAND: &str =
    "lsof -nP -iTCP -sTCP:LISTEN | awk 'NR>1 {print $9}' | awk -F ':' '{print $NF}' | sort -n | uniq";

/// List TCP ports currently in the LISTEN state, ascending, deduplicated.
pub async fn list_active_ports() -> Result<Vec<u16>> {
    let output = run_listing_command().await?;
    Ok(parse_port_lines(&output))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
async fn run_listing_command() -> Result<String> {
    let output = Command::new("/bin/sh")
        .args(["-c", LIST_COMMAND])
        .output()
        .await
        .map_err(|e| WorkbenchError::external(format!("Failed to list active ports: {e}")))?;
    if !output.status.success() {
        return Err(WorkbenchError::external(format!(
            "Failed to list active ports: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(windows)]
async fn run_listing_command() -> Result<String> {
    let script = "Get-NetTCPConnection -State Listen | Select-Object -ExpandProperty LocalPort | Sort-Object -Unique";
    let output = Command::new("powershell")
        .args(["-NoProfile", "-Command", script])
        .output()
        .await
        .map_err(|e| WorkbenchError::external(format!("Failed to list active ports: {e}")))?;
    if !output.status.success() {
        return Err(WorkbenchError::external(format!(
            "Failed to list active ports: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    windows
)))]
async fn run_listing_command() -> Result<String> {
    Err(WorkbenchError::external(format!(
        "Failed to list active ports: unsupported platform {}",
        std::env::consts::OS
    )))
}

/// Parse one port per line; rejects 0, anything above 65535, and non-numeric
/// tokens. Result is sorted ascending with duplicates removed.
pub fn parse_port_lines(output: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = output
        .lines()
        .filter_map(|line| {
            let token = line.trim();
            let value: u32 = token.parse().ok()?;
            if (1..=65535).contains(&value) {
                Some(value as u16)
            } else {
                None
            }
        })
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_ports_sorted_and_deduped() {
        let out = "8080\n22\n  443\n8080\n3000\n";
        assert_eq!(parse_port_lines(out), vec![22, 443, 3000, 8080]);
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        let out = "0\n65536\n70000\nhttp\n-1\n\n65535\n1\n";
        assert_eq!(parse_port_lines(out), vec![1, 65535]);
    }
}
