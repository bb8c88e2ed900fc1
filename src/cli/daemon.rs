// CLI server commands: serve, status

use std::path::PathBuf;

use reqwest::Client;
use serde_json::Value;

use super::{base_url, connection_error_message};
use crate::daemon::{start_server, ServeOptions};

/// Helper to handle reqwest errors and produce a user-friendly connection error.
pub(crate) fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// djr serve
pub async fn cmd_serve(
    host: &str,
    config: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
    ephemeral: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    // Only a non-default global --host overrides the config file.
    let host_override = if host != "127.0.0.1" {
        Some(host.to_string())
    } else {
        None
    };

    start_server(ServeOptions {
        config_path: config.map(PathBuf::from),
        data_dir: data_dir.map(PathBuf::from),
        host: host_override,
        port: port_override,
        ephemeral,
        verbose,
    })
    .await
}

/// djr status
pub async fn cmd_status(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("Server returned an error");
        anyhow::bail!("{}", message);
    }

    let server_status = body["status"].as_str().unwrap_or("unknown");
    let version = body["version"].as_str().unwrap_or("unknown");
    let uptime = body["uptime_seconds"].as_u64().unwrap_or(0);
    let running = body["running_jobs"].as_u64().unwrap_or(0);
    let pending = body["pending_jobs"].as_u64().unwrap_or(0);
    let total = body["total_jobs"].as_u64().unwrap_or(0);
    let data_dir = body["data_dir"].as_str().unwrap_or("unknown");

    println!("Server Status: {}", server_status);
    println!("  Address:     {}", base_url(host, port));
    println!("  Data Dir:    {}", data_dir);
    println!(
        "  Jobs:        {} running / {} pending / {} total",
        running, pending, total
    );
    println!("  Uptime:      {}", format_uptime(uptime));
    println!("  Version:     {}", version);

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    Ok(())
}

/// Format uptime seconds into a human-readable string.
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(3600), "1h 0m 0s");
        assert_eq!(format_uptime(90061), "1d 1h 1m 1s");
    }

    #[tokio::test]
    async fn test_cmd_status_connection_error() {
        // Port 1 is almost certainly not listening.
        let err = cmd_status("127.0.0.1", 1, false)
            .await
            .expect_err("no server");
        let msg = err.to_string();
        assert!(
            msg.contains("Could not connect") || msg.contains("Request failed"),
            "Got: {}",
            msg
        );
    }
}
