//! CLI commands implementation

use anyhow::{Context, Result};
use modelship_core::{
    select_latest_run, Alias, FeatureRow, NewVersion, Registered, RunRecord, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

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

    fn model_url(&self, model: &str, rest: &str) -> String {
        self.url(&format!("/api/v1/models/{}{}", model, rest))
    }
}

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Turn a non-success response into an error carrying the server's detail
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await?;
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.detail)
        .unwrap_or(text);
    anyhow::bail!("Failed to {} ({}): {}", action, status, detail)
}

/// Parse `key=value`
pub fn parse_tag(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Alias write response
#[derive(Debug, Deserialize)]
pub struct AliasUpdate {
    #[serde(flatten)]
    pub alias: Alias,
    pub previous: Option<u64>,
}

/// Promotion response
#[derive(Debug, Deserialize)]
pub struct PromotionResponse {
    pub version: Version,
    pub outcome: String,
    pub alias: String,
    pub previous: Option<u64>,
}

/// Register a version
pub async fn register(
    client: &ApiClient,
    model: &str,
    run: String,
    artifact: String,
    description: String,
    tags: Vec<(String, String)>,
) -> Result<()> {
    let mut req = NewVersion::new(run, artifact).with_description(description);
    req.tags.extend(tags);

    let response = client
        .client
        .post(client.model_url(model, "/versions"))
        .json(&req)
        .send()
        .await?;
    let registered: Registered = check(response, "register version").await?.json().await?;

    println!(
        "{} v{} ({})",
        registered.version.model, registered.version.number, registered.outcome
    );
    println!("  Run: {}", registered.version.source_run_ref);
    println!("  Artifact: {}", registered.version.artifact_location);
    Ok(())
}

/// Set a tag on a version
pub async fn tag(
    client: &ApiClient,
    model: &str,
    version: u64,
    key: String,
    value: String,
) -> Result<()> {
    #[derive(Serialize)]
    struct TagRequest {
        key: String,
        value: String,
    }

    let response = client
        .client
        .put(client.model_url(model, &format!("/versions/{}/tags", version)))
        .json(&TagRequest { key, value })
        .send()
        .await?;
    let version: Version = check(response, "set tag").await?.json().await?;

    println!("{} v{} tags:", version.model, version.number);
    for (k, v) in &version.tags {
        println!("  {}={}", k, v);
    }
    Ok(())
}

/// Point an alias at a version
pub async fn set_alias(
    client: &ApiClient,
    model: &str,
    alias: &str,
    version: Option<u64>,
) -> Result<()> {
    #[derive(Serialize)]
    struct SetAliasRequest {
        version: Option<u64>,
    }

    let response = client
        .client
        .put(client.model_url(model, &format!("/aliases/{}", alias)))
        .json(&SetAliasRequest { version })
        .send()
        .await?;
    let update: AliasUpdate = check(response, "set alias").await?.json().await?;

    match update.previous {
        Some(prev) if prev != update.alias.version => println!(
            "Alias @{} -> {} v{} (was v{})",
            update.alias.name, update.alias.model, update.alias.version, prev
        ),
        _ => println!(
            "Alias @{} -> {} v{}",
            update.alias.name, update.alias.model, update.alias.version
        ),
    }
    Ok(())
}

async fn fetch_versions(client: &ApiClient, model: &str) -> Result<Vec<Version>> {
    let response = client
        .client
        .get(client.model_url(model, "/versions"))
        .send()
        .await?;
    Ok(check(response, "list versions").await?.json().await?)
}

/// List versions
pub async fn list_versions(client: &ApiClient, model: &str) -> Result<()> {
    let versions = fetch_versions(client, model).await?;

    println!(
        "{:<8} {:<36} {:<26} {:<30}",
        "VERSION", "RUN", "CREATED", "ARTIFACT"
    );
    println!("{}", "-".repeat(100));
    for v in versions {
        println!(
            "{:<8} {:<36} {:<26} {:<30}",
            v.number,
            v.source_run_ref,
            v.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            v.artifact_location
        );
    }
    Ok(())
}

/// Aliases grouped by the version they designate
pub fn aliases_by_version(
    versions: &[u64],
    aliases: &BTreeMap<String, u64>,
) -> Vec<(u64, Vec<String>)> {
    versions
        .iter()
        .map(|v| {
            let names = aliases
                .iter()
                .filter(|(_, target)| *target == v)
                .map(|(name, _)| name.clone())
                .collect();
            (*v, names)
        })
        .collect()
}

/// List each version with its aliases
pub async fn list_aliases(client: &ApiClient, model: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct Snapshot {
        aliases: BTreeMap<String, u64>,
    }

    let versions = fetch_versions(client, model).await?;
    let response = client
        .client
        .get(client.model_url(model, "/aliases"))
        .send()
        .await?;
    let snapshot: Snapshot = check(response, "list aliases").await?.json().await?;

    let numbers: Vec<u64> = versions.iter().map(|v| v.number).collect();
    for (version, names) in aliases_by_version(&numbers, &snapshot.aliases) {
        println!("v{}: aliases={:?}", version, names);
    }
    Ok(())
}

/// Check that each alias resolves to a version
pub async fn verify_aliases(client: &ApiClient, model: &str, aliases: &[String]) -> Result<()> {
    let mut missing = 0;
    for alias in aliases {
        let response = client
            .client
            .get(client.model_url(model, &format!("/aliases/{}", alias)))
            .send()
            .await?;
        match check(response, "get alias").await {
            Ok(response) => {
                let bound: Alias = response.json().await?;
                println!("@{} -> {} v{}", alias, model, bound.version);
            }
            Err(e) => {
                missing += 1;
                println!("@{} not set ({})", alias, e);
            }
        }
    }

    if missing > 0 {
        anyhow::bail!("{} of {} aliases not set", missing, aliases.len());
    }
    Ok(())
}

/// Where a promotion takes its run from
#[derive(Debug)]
pub enum PromoteSource {
    /// An explicit run and artifact
    Run { run: String, artifact: String },
    /// A file of run records, filtered by the selection policy
    Runs(PathBuf),
}

fn load_runs(path: &Path) -> Result<Vec<RunRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid run records in {}", path.display()))
}

/// Version request for a selected run; the run's tags come along
fn version_from_run(run: &RunRecord) -> NewVersion {
    let mut version = NewVersion::new(run.run_id.clone(), run.artifact_location.clone());
    version.tags.extend(run.tags.clone());
    version
}

/// Register a run and point an alias at it
pub async fn promote(
    client: &ApiClient,
    model: &str,
    source: PromoteSource,
    alias: String,
    description: String,
    tags: Vec<(String, String)>,
) -> Result<()> {
    let mut version = match source {
        PromoteSource::Run { run, artifact } => NewVersion::new(run, artifact),
        PromoteSource::Runs(path) => {
            let runs = load_runs(&path)?;
            let run = select_latest_run(&runs)
                .with_context(|| format!("No finished runs in {}", path.display()))?;
            println!("Using run_id={}", run.run_id);
            version_from_run(run)
        }
    };
    version = version
        .with_description(description)
        .with_tag("registered_by", "programmatic");
    version.tags.extend(tags);

    #[derive(Serialize)]
    struct PromoteRequest {
        #[serde(flatten)]
        version: NewVersion,
        alias: String,
    }

    debug!(model = model, run = %version.source_run_ref, "Promoting");
    let response = client
        .client
        .post(client.model_url(model, "/promote"))
        .json(&PromoteRequest { version, alias })
        .send()
        .await?;
    let promotion: PromotionResponse = check(response, "promote").await?.json().await?;

    println!(
        "{} v{} ({}); alias @{} set",
        promotion.version.model,
        promotion.version.number,
        promotion.outcome.replace('_', " "),
        promotion.alias
    );
    if let Some(prev) = promotion.previous {
        if prev != promotion.version.number {
            println!("  @{} previously pointed at v{}", promotion.alias, prev);
        }
    }
    Ok(())
}

/// Accept either a JSON array of rows or a `{"inputs": [...]}` body
pub fn parse_rows(raw: &str) -> Result<Vec<FeatureRow>> {
    let value: Value = serde_json::from_str(raw).context("Input is not valid JSON")?;
    let rows = match value {
        Value::Object(mut body) if body.contains_key("inputs") => body
            .remove("inputs")
            .unwrap_or(Value::Array(Vec::new())),
        Value::Object(row) => Value::Array(vec![Value::Object(row)]),
        other => other,
    };
    serde_json::from_value(rows).context("Expected a JSON object or an array of objects")
}

/// Request predictions
pub async fn predict(client: &ApiClient, input: &str, model_ref: Option<String>) -> Result<()> {
    let raw = match input.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?
        }
        None => input.to_string(),
    };
    let inputs = parse_rows(&raw)?;

    let mut request = client
        .client
        .post(client.url("/predict"))
        .json(&serde_json::json!({ "inputs": inputs }));
    if let Some(model_ref) = model_ref {
        request = request.query(&[("model_ref", model_ref)]);
    }
    let response = request.send().await?;
    let body: Value = check(response, "predict").await?.json().await?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Show server health
pub async fn health(client: &ApiClient) -> Result<()> {
    #[derive(Deserialize)]
    struct Health {
        status: String,
        model_ref: String,
        model_loaded: bool,
    }

    let response = client.client.get(client.url("/health")).send().await?;
    let health: Health = check(response, "get health").await?.json().await?;

    println!("Status: {}", health.status);
    println!("Model: {}", health.model_ref);
    println!("Loaded: {}", if health.model_loaded { "yes" } else { "no" });
    Ok(())
}

/// Show predictor cache status
pub async fn cache(client: &ApiClient) -> Result<()> {
    #[derive(Deserialize)]
    struct Stats {
        entries: usize,
        pinned: usize,
        capacity: usize,
        in_flight: usize,
        loads: u64,
        failures: u64,
        hits: u64,
        evictions: u64,
    }

    #[derive(Deserialize)]
    struct Entry {
        model: String,
        version: u64,
        pinned: bool,
        hits: u64,
    }

    #[derive(Deserialize)]
    struct CacheStatus {
        stats: Stats,
        entries: Vec<Entry>,
    }

    let response = client.client.get(client.url("/api/v1/cache")).send().await?;
    let status: CacheStatus = check(response, "get cache status").await?.json().await?;
    let s = status.stats;

    println!(
        "Entries: {}/{} ({} pinned, {} loading)",
        s.entries, s.capacity, s.pinned, s.in_flight
    );
    println!(
        "Loads: {} ({} failed)  Hits: {}  Evictions: {}",
        s.loads, s.failures, s.hits, s.evictions
    );
    if !status.entries.is_empty() {
        println!();
        println!("{:<30} {:<8} {:<8} {:<8}", "MODEL", "VERSION", "PINNED", "HITS");
        for e in status.entries {
            println!(
                "{:<30} {:<8} {:<8} {:<8}",
                e.model,
                e.version,
                if e.pinned { "yes" } else { "no" },
                e.hits
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag() {
        assert_eq!(
            parse_tag("stage=prod").unwrap(),
            ("stage".to_string(), "prod".to_string())
        );
        assert_eq!(parse_tag("note=a=b").unwrap().1, "a=b");
        assert!(parse_tag("novalue").is_err());
        assert!(parse_tag("=x").is_err());
    }

    #[test]
    fn test_parse_rows_shapes() {
        assert_eq!(parse_rows(r#"[{"f1": 1}, {"f1": 2}]"#).unwrap().len(), 2);
        assert_eq!(parse_rows(r#"{"inputs": [{"f1": 1}]}"#).unwrap().len(), 1);
        assert_eq!(parse_rows(r#"{"f1": 1, "f2": 2}"#).unwrap().len(), 1);
        assert!(parse_rows("[1, 2]").is_err());
        assert!(parse_rows("not json").is_err());
    }

    #[test]
    fn test_aliases_by_version() {
        let aliases: BTreeMap<String, u64> = [("prod".to_string(), 2), ("staging".to_string(), 2)]
            .into_iter()
            .collect();
        let grouped = aliases_by_version(&[1, 2], &aliases);
        assert_eq!(grouped[0], (1, vec![]));
        assert_eq!(grouped[1], (2, vec!["prod".to_string(), "staging".to_string()]));
    }

    #[test]
    fn test_selected_run_keeps_its_tags() {
        let runs: Vec<RunRecord> = serde_json::from_str(
            r#"[
                {"run_id": "a", "status": "finished", "started_at": "2024-05-01T12:00:00Z",
                 "ended_at": "2024-05-01T12:05:00Z", "artifact_location": "runs/a/model.json"},
                {"run_id": "b", "status": "finished", "started_at": "2024-05-01T13:00:00Z",
                 "ended_at": "2024-05-01T13:05:00Z", "artifact_location": "runs/b/model.json",
                 "tags": {"dataset": "breast_cancer"}}
            ]"#,
        )
        .unwrap();

        let version = version_from_run(select_latest_run(&runs).unwrap());
        assert_eq!(version.source_run_ref, "b");
        assert_eq!(version.artifact_location, "runs/b/model.json");
        assert_eq!(version.tags["dataset"], "breast_cancer");
    }
}
