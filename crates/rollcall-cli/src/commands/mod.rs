//! CLI command implementations.

pub mod jobs;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use url::Url;

/// Thin JSON client for the API server.
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("Invalid API URL: {}", api_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self.http.get(self.url(path)?).query(query).send().await?;
        Self::decode(response).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut request = self.http.post(self.url(path)?);
        if let Some(body) = body {
            request = request.json(&body);
        }
        Self::decode(request.send().await?).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("request failed");
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }
}

pub async fn recover(client: &ApiClient) -> Result<()> {
    let summary = client.post("api/v1/jobs/recover", None).await?;
    println!(
        "Scanned {}: {} requeued, {} recovered, {} failed, {} skipped",
        summary["scanned"],
        summary["pendingRequeued"],
        summary["processingRecovered"],
        summary["failed"],
        summary["skipped"]
    );
    Ok(())
}

pub async fn workers(client: &ApiClient) -> Result<()> {
    let status = client.get("api/v1/workers/status", &[]).await?;
    print!("{}", render_workers(&status));
    Ok(())
}

fn render_workers(status: &Value) -> String {
    let pool = &status["pool"];
    let mut out = format!(
        "Pool: {}/{} active, {} waiting\n",
        pool["activeWorkers"], pool["maxWorkers"], pool["waitingJobs"]
    );
    if let Some(by_type) = pool["maxByType"].as_object() {
        for (job_type, max) in by_type {
            out.push_str(&format!(
                "  {:<20} {}/{}\n",
                job_type, pool["activeByType"][job_type], max
            ));
        }
    }
    if let Some(queues) = status["queues"].as_object() {
        out.push_str("Queues:\n");
        for (queue, counts) in queues {
            out.push_str(&format!(
                "  {:<20} waiting={} active={} delayed={} failed={} completed={}\n",
                queue,
                counts["waiting"],
                counts["active"],
                counts["delayed"],
                counts["failed"],
                counts["completed"]
            ));
        }
    }
    out.push_str(&format!("Consumers: {}\n", status["activeWorkers"]));
    out
}

pub fn validate_config(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    match rollcall_config::parse_system_config(&content) {
        Ok(config) => {
            if let Err(e) = config.workers.validate() {
                println!("Configuration error: {}", e);
                std::process::exit(1);
            }
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_joins_under_base_path() {
        let client = ApiClient::new("http://ops.example.com/rollcall").unwrap();
        assert_eq!(
            client.url("/api/v1/jobs").unwrap().as_str(),
            "http://ops.example.com/rollcall/api/v1/jobs"
        );
        assert!(ApiClient::new("not a url").is_err());
    }

    #[test]
    fn test_render_workers() {
        let out = render_workers(&json!({
            "activeWorkers": 4,
            "workerNames": [],
            "pool": {
                "maxWorkers": 4,
                "activeWorkers": 1,
                "waitingJobs": 0,
                "maxByType": { "geocode": 2 },
                "activeByType": { "geocode": 1 }
            },
            "queues": {
                "geocode": { "waiting": 3, "active": 1, "delayed": 0, "failed": 0, "completed": 9 }
            }
        }));
        assert!(out.starts_with("Pool: 1/4 active, 0 waiting"));
        assert!(out.contains("geocode              1/2"));
        assert!(out.contains("waiting=3 active=1"));
        assert!(out.ends_with("Consumers: 4\n"));
    }
}
