//! CLI commands implementation

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use gpusched_core::{GpuDevice, JobStatus};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

const GIB: u64 = 1024 * 1024 * 1024;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn an error status into an error carrying the response body
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error = response.text().await.unwrap_or_default();
    bail!("Failed to {}: {} {}", action, status, error.trim())
}

/// Submission response from API
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority_score: f64,
}

/// Queue entry from API
#[derive(Debug, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority_score: f64,
    pub user_id: String,
    pub partition: String,
    pub qos: String,
    pub vram_required: u64,
    pub assigned_gpu_id: Option<u32>,
    #[allow(dead_code)]
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub unschedulable: bool,
}

/// Submit a script
pub async fn submit(
    client: &ApiClient,
    script: PathBuf,
    vram_required: u64,
    partition: String,
    qos: String,
    user: Option<String>,
) -> Result<()> {
    let content = tokio::fs::read_to_string(&script)
        .await
        .with_context(|| format!("reading {}", script.display()))?;

    let user_id = user
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "anonymous".to_string());

    #[derive(Serialize)]
    struct SubmitRequest {
        user_id: String,
        script: String,
        script_name: Option<String>,
        vram_required: u64,
        partition: String,
        qos: String,
    }

    let req = SubmitRequest {
        user_id,
        script: content,
        script_name: script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        vram_required,
        partition,
        qos,
    };

    let response = client
        .client
        .post(client.url("/api/v1/jobs/submit"))
        .json(&req)
        .send()
        .await?;
    let job: SubmitResponse = check(response, "submit job").await?.json().await?;

    println!("Job {} submitted", job.id);
    println!("  Status: {}", job.status);
    println!("  Priority: {:.1}", job.priority_score);

    Ok(())
}

/// List jobs
pub async fn queue(client: &ApiClient, status: Option<String>) -> Result<()> {
    let mut request = client.client.get(client.url("/api/v1/jobs/queue"));
    if let Some(status) = &status {
        request = request.query(&[("status", status)]);
    }

    let response = request.send().await?;
    let jobs: Vec<QueueEntry> = check(response, "list jobs").await?.json().await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:>10} {:<12} {:<10} {:<10} {:>9} {:<9}",
        "ID", "STATUS", "PRIORITY", "USER", "PARTITION", "QOS", "VRAM", "GPU"
    );
    println!("{}", "-".repeat(115));
    for job in jobs {
        println!(
            "{:<36} {:<10} {:>10.1} {:<12} {:<10} {:<10} {:>9} {:<9}",
            job.id,
            job.status,
            job.priority_score,
            job.user_id,
            job.partition,
            job.qos,
            format_size(job.vram_required),
            gpu_column(&job),
        );
    }

    Ok(())
}

fn gpu_column(job: &QueueEntry) -> String {
    match job.assigned_gpu_id {
        Some(gpu_id) => gpu_id.to_string(),
        None if job.unschedulable => "none fits".to_string(),
        None => "-".to_string(),
    }
}

/// Show a job
pub async fn job(client: &ApiClient, id: Uuid) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/jobs/{}", id)))
        .send()
        .await?;
    let job: serde_json::Value = check(response, "get job").await?.json().await?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

/// Show GPU devices
pub async fn gpus(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/gpu/metrics"))
        .send()
        .await?;
    let devices: Vec<GpuDevice> = check(response, "get GPU metrics").await?.json().await?;

    for device in devices {
        let temperature = device
            .temperature
            .map(|t| format!("{}C", t))
            .unwrap_or_else(|| "-".to_string());
        let utilization = device
            .utilization
            .map(|u| format!("{}%", u))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "[{}] {} - {}/{} used - {} - {} - {}",
            device.gpu_id,
            device.name,
            format_size(device.memory_used),
            format_size(device.memory_total),
            temperature,
            utilization,
            if device.is_healthy {
                "Healthy"
            } else {
                "Unhealthy"
            }
        );
    }

    Ok(())
}

/// Print job output
pub async fn logs(client: &ApiClient, id: Uuid, follow: bool) -> Result<()> {
    let mut response = client
        .client
        .get(client.url(&format!("/api/v1/jobs/{}/logs", id)))
        .query(&[("follow", follow)])
        .send()
        .await?;
    response = check(response, "get logs").await?;

    let mut stdout = std::io::stdout().lock();
    while let Some(chunk) = response.chunk().await? {
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }

    Ok(())
}

/// Parse a byte size such as `1024`, `8G`, `8GiB` or `500MB`.
///
/// Single-letter and `iB` units are binary, `B` units are decimal.
pub fn parse_size(input: &str) -> std::result::Result<u64, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KIB" => 1024,
        "M" | "MIB" => 1024 * 1024,
        "G" | "GIB" => GIB,
        "T" | "TIB" => 1024 * GIB,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        other => return Err(format!("unknown size unit '{}'", other)),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", input))
}

fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1}GiB", bytes as f64 / GIB as f64)
    } else {
        format!("{}MiB", bytes / (1024 * 1024))
    }
}
