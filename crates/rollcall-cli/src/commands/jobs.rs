//! Job commands.

use anyhow::Result;
use serde_json::{Value, json};

use super::ApiClient;

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let job = client.get(&format!("api/v1/jobs/{}", id), &[]).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn list(
    client: &ApiClient,
    status: Option<String>,
    job_type: Option<String>,
    limit: u32,
) -> Result<()> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(status) = status {
        query.push(("status", status));
    }
    if let Some(job_type) = job_type {
        query.push(("type", job_type));
    }

    let jobs = client.get("api/v1/jobs", &query).await?;
    let jobs = jobs.as_array().map(Vec::as_slice).unwrap_or_default();
    if jobs.is_empty() {
        println!("No jobs found");
    }
    for job in jobs {
        println!("{}", summary_line(job));
    }
    Ok(())
}

pub async fn control(client: &ApiClient, id: &str, action: &str) -> Result<()> {
    let job = client
        .post(
            &format!("api/v1/jobs/{}/action", id),
            Some(json!({ "action": action })),
        )
        .await?;
    println!("{}", summary_line(&job));
    Ok(())
}

fn summary_line(job: &Value) -> String {
    let text = |key: &str| job[key].as_str().unwrap_or("-").to_string();
    let progress = match (job["processedItems"].as_u64(), job["totalItems"].as_u64()) {
        (Some(done), Some(total)) if total > 0 => format!("{}/{}", done, total),
        (Some(done), _) => done.to_string(),
        _ => "-".to_string(),
    };
    format!(
        "{}  {:<18} {:<10} {:>11}  {}",
        text("id"),
        text("type"),
        text("status"),
        progress,
        text("createdAt")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line() {
        let line = summary_line(&json!({
            "id": "0190f0aa-0000-7000-8000-000000000001",
            "type": "geocode",
            "status": "paused",
            "processedItems": 100,
            "totalItems": 150,
            "createdAt": "2026-03-01T10:00:00Z"
        }));
        assert!(line.starts_with("0190f0aa-0000-7000-8000-000000000001  geocode"));
        assert!(line.contains("paused"));
        assert!(line.contains("100/150"));
    }

    #[test]
    fn test_summary_line_without_total() {
        let line = summary_line(&json!({ "id": "x", "processedItems": 0, "totalItems": 0 }));
        assert!(line.contains(" 0  "));
        assert!(line.contains("-"));
    }
}
