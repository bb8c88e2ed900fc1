// CLI job commands: submit, list, show, delete, cancel, watch

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde_json::{json, Value};

use super::base_url;
use super::daemon::handle_request_error;
use crate::models::OptionSet;

/// Turn a non-success API response into an error carrying its message.
async fn api_failure(response: Response) -> anyhow::Error {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .unwrap_or_else(|_| json!({"message": "Unknown error"}));
    let message = body["message"].as_str().unwrap_or("Unknown error");
    anyhow::anyhow!("{} ({})", message, status)
}

async fn read_json(response: Response) -> anyhow::Result<Value> {
    if !response.status().is_success() {
        return Err(api_failure(response).await);
    }
    response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))
}

/// Format a past timestamp as "2 minutes ago".
fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let secs = Utc::now().signed_duration_since(*dt).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// djr submit
pub async fn cmd_submit(
    host: &str,
    port: u16,
    urls: &[String],
    options: &OptionSet,
    follow: bool,
) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/batch", base_url(host, port));

    let response = client
        .post(&url)
        .json(&json!({ "urls": urls, "options": options }))
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    let body = read_json(response).await?;

    let empty = vec![];
    let jobs = body["jobs"].as_array().unwrap_or(&empty);
    for job in jobs {
        let id = job["job_id"].as_str().unwrap_or("?");
        let status = job["status"].as_str().unwrap_or("?");
        let count = job["urls"].as_array().map(|u| u.len()).unwrap_or(0);
        println!("Job {} ({}) started for {} URL(s).", id, status, count);
    }
    for rejected in body["rejected"].as_array().unwrap_or(&empty) {
        eprintln!(
            "Rejected {}: {}",
            rejected["url"].as_str().unwrap_or("?"),
            rejected["reason"].as_str().unwrap_or("unknown reason")
        );
    }

    if follow {
        // Replay covers output produced before the stream opens.
        for job in jobs {
            if let Some(id) = job["job_id"].as_str() {
                println!("--- {} ---", id);
                watch_job(&client, host, port, id).await?;
            }
        }
    }

    Ok(())
}

/// djr list
pub async fn cmd_list(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    let body = read_json(response).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let empty = vec![];
    let jobs = body.as_array().unwrap_or(&empty);
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<10}{:<11}{:<6}{:<7}{:<7}{:<18}{}",
        "ID", "STATUS", "URLS", "DL", "SKIP", "CREATED", "SITE"
    );
    for job in jobs {
        let id = job["id"].as_str().unwrap_or("?");
        let created = job["created_at"]
            .as_str()
            .and_then(|ts| ts.parse::<DateTime<Utc>>().ok())
            .map(|dt| format_relative_time(&dt))
            .unwrap_or_else(|| "-".to_string());
        let site = job["site_rule"]
            .as_str()
            .or_else(|| job["site_pattern"].as_str())
            .unwrap_or("-");

        println!(
            "{:<10}{:<11}{:<6}{:<7}{:<7}{:<18}{}",
            short_id(id),
            job["status"].as_str().unwrap_or("?"),
            job["urls"].as_array().map(|u| u.len()).unwrap_or(0),
            job["download_count"].as_u64().unwrap_or(0),
            job["skip_count"].as_u64().unwrap_or(0),
            created,
            site
        );
    }

    Ok(())
}

/// djr show
pub async fn cmd_show(host: &str, port: u16, job: &str, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}", base_url(host, port), job);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    let body = read_json(response).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Job {}", body["id"].as_str().unwrap_or(job));
    println!("  Status:    {}", body["status"].as_str().unwrap_or("?"));
    if let Some(user) = body["requested_by"].as_str() {
        println!("  By:        {}", user);
    }
    if let Some(site) = body["site_rule"].as_str() {
        println!("  Site rule: {}", site);
    }
    println!(
        "  Counts:    {} downloaded, {} skipped",
        body["download_count"].as_u64().unwrap_or(0),
        body["skip_count"].as_u64().unwrap_or(0)
    );
    if let Some(code) = body["exit_code"].as_i64() {
        println!("  Exit code: {}", code);
    }
    if let Some(error) = body["error"].as_str() {
        println!("  Error:     {}", error);
    }
    println!("  URLs:");
    for u in body["urls"].as_array().into_iter().flatten() {
        println!("    {}", u.as_str().unwrap_or("?"));
    }

    let output = body["output"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if !output.is_empty() {
        println!();
        for line in output {
            print_line(line)?;
        }
    }

    Ok(())
}

/// djr delete
pub async fn cmd_delete(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}", base_url(host, port), job);

    let response = client
        .delete(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    let body = read_json(response).await?;

    if body["cancelled"].as_bool().unwrap_or(false) {
        println!("Job {} cancelled and deleted.", job);
    } else {
        println!("Job {} deleted.", job);
    }
    if let Some(warning) = body["warning"].as_str() {
        eprintln!("Warning: {}", warning);
    }

    Ok(())
}

/// djr cancel
pub async fn cmd_cancel(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}/cancel", base_url(host, port), job);

    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    let body = read_json(response).await?;

    println!(
        "Job {} is now {}.",
        job,
        body["status"].as_str().unwrap_or("unknown")
    );
    Ok(())
}

/// djr watch
pub async fn cmd_watch(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    watch_job(&client, host, port, job).await
}

async fn watch_job(client: &Client, host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let url = format!("{}/api/jobs/{}/stream", base_url(host, port), job);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    if !response.status().is_success() {
        return Err(api_failure(response).await);
    }
    follow_sse_stream(response).await
}

fn print_line(line: &Value) -> anyhow::Result<()> {
    let text = line["text"].as_str().unwrap_or("");
    match line["stream"].as_str() {
        Some("stderr") | Some("error") => eprintln!("{}", text),
        _ => {
            println!("{}", text);
            io::stdout().flush()?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// One server-sent event: its `event:` name and joined `data:` lines.
#[derive(Debug, PartialEq)]
pub(crate) struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Incremental SSE frame parser for a chunked response body. Bytes are
/// buffered so a character split across chunks decodes intact.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a chunk and return every event it completed. Comments such as
    /// keepalives are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend(chunk.iter().filter(|b| **b != b'\r'));

        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let block = String::from_utf8_lossy(&block);

            let mut event = String::new();
            let mut data: Vec<&str> = Vec::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = rest.trim_start().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }

            if !event.is_empty() || !data.is_empty() {
                messages.push(SseMessage {
                    event,
                    data: data.join("\n"),
                });
            }
        }
        messages
    }
}

/// Print a job stream until its `finished` event. A job that did not
/// complete is reported as an error so the exit status reflects it.
async fn follow_sse_stream(response: Response) -> anyhow::Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {}", e))?;
        for message in parser.push(&chunk) {
            let Ok(json) = serde_json::from_str::<Value>(&message.data) else {
                continue;
            };
            let data = &json["data"];
            match message.event.as_str() {
                "output" => print_line(data)?,
                "finished" => {
                    let status = data["status"].as_str().unwrap_or("unknown");
                    println!(
                        "--- Job {} ({} downloaded, {} skipped) ---",
                        status,
                        data["download_count"].as_u64().unwrap_or(0),
                        data["skip_count"].as_u64().unwrap_or(0)
                    );
                    if status != "completed" {
                        let reason = data["error"].as_str().unwrap_or(status);
                        anyhow::bail!("Job {}", reason);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    anyhow::bail!("Stream ended before the job finished")
}
