use crate::config::ProviderCommandConfig;
use crate::models::ComputedMetric;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

pub type ProviderFuture<'a> = Pin<Box<dyn Future<Output = Result<ComputedMetric, ProviderError>> + Send + 'a>>;

/// Everything a provider needs to compute one metric.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationRequest {
    pub slug: String,
    pub instructions: String,
    pub template_html: String,
    /// Current `values_json` of each direct dependency, keyed by slug.
    pub dependencies: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not reach or read its upstream source.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// The upstream answered, but the provider judged the result unusable.
    #[error("derived status '{status}': {message}")]
    Derived { status: String, message: String },
    #[error("timed out")]
    Timeout,
    #[error("invalid output: {0}")]
    InvalidOutput(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Derived { .. } => "derived",
            Self::Timeout => "timeout",
            Self::InvalidOutput(_) => "invalid_output",
        }
    }
}

/// The external agent that turns instructions and dependency values into a metric value.
///
/// Calls may be retried on the next cycle, so implementations should be safe to repeat.
pub trait ComputationProvider: Send + Sync {
    fn compute<'a>(&'a self, request: &'a ComputationRequest) -> ProviderFuture<'a>;
}

/// Runs a configured command per computation.
///
/// The request is written to stdin as JSON; stdout must contain an object with
/// `values` and `html`. The child is killed if the computation is abandoned.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    config: ProviderCommandConfig,
}

impl CommandProvider {
    pub fn new(config: ProviderCommandConfig) -> Self {
        Self { config }
    }

    async fn run(&self, request: &ComputationRequest) -> Result<ComputedMetric, ProviderError> {
        let payload = serde_json::to_vec(request)
            .map_err(|error| ProviderError::InvalidOutput(format!("failed to encode request: {}", error)))?;

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env("METRIC_SLUG", &request.slug)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|error| {
            ProviderError::Fetch(format!("failed to spawn '{}': {}", self.config.command, error))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                if let Err(error) = stdin.write_all(&payload).await {
                    tracing::debug!(error = %error, "provider closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|error| ProviderError::Fetch(format!("failed to wait for provider: {}", error)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            return Err(ProviderError::Fetch(format!(
                "provider exited with {}: {}",
                output.status, detail
            )));
        }

        parse_metric_output(&stdout)
    }
}

impl ComputationProvider for CommandProvider {
    fn compute<'a>(&'a self, request: &'a ComputationRequest) -> ProviderFuture<'a> {
        Box::pin(self.run(request))
    }
}

/// Extracts `{ "values": ..., "html": "..." }` from provider stdout.
///
/// Accepts a bare JSON document, a fenced ```json block, or the first balanced
/// object in free-form text. An object carrying `status` and `error` but no
/// `values` is reported as a derived failure.
pub fn parse_metric_output(raw: &str) -> Result<ComputedMetric, ProviderError> {
    let candidates = [
        Some(raw.trim()),
        fenced_json_block(raw),
        first_balanced_object(raw),
    ];
    for candidate in candidates.into_iter().flatten() {
        let Ok(parsed) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if let Some(result) = interpret_output(&parsed) {
            return result;
        }
    }
    Err(ProviderError::InvalidOutput(
        "no JSON object with 'values' and 'html' keys found".to_string(),
    ))
}

fn interpret_output(parsed: &Value) -> Option<Result<ComputedMetric, ProviderError>> {
    if let (Some(values), Some(html)) = (parsed.get("values"), parsed.get("html")) {
        return Some(Ok(ComputedMetric {
            values: values.clone(),
            rendered: html.as_str().unwrap_or_default().to_string(),
        }));
    }
    let status = parsed.get("status").and_then(Value::as_str)?;
    let message = parsed.get("error").and_then(Value::as_str)?;
    Some(Err(ProviderError::Derived {
        status: status.to_string(),
        message: message.to_string(),
    }))
}

fn fenced_json_block(raw: &str) -> Option<&str> {
    let start = raw.find("```json")?;
    let after = &raw[start + "```json".len()..];
    let end = after.find("```")?;
    Some(after[..end].trim())
}

fn first_balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (index, byte) in raw.bytes().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=index]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Checks computed values against the optional `outputSchema` in a definition's metadata.
/// `null` values are always rejected.
pub fn validate_output_schema(metadata: &Value, values: &Value) -> Result<(), ProviderError> {
    if values.is_null() {
        return Err(ProviderError::InvalidOutput("'values' must not be null".to_string()));
    }
    let Some(schema) = metadata.get("outputSchema") else {
        return Ok(());
    };
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|error| ProviderError::InvalidOutput(format!("outputSchema does not compile: {}", error)))?;
    let result = compiled.validate(values);
    if let Err(errors) = result {
        let messages: Vec<String> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", path, error)
                }
            })
            .collect();
        return Err(ProviderError::InvalidOutput(messages.join("; ")));
    }
    Ok(())
}
