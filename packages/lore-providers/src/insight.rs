use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{Error, Result};

const MAX_ATTEMPTS: usize = 3;

/// Sends a chat completion request and returns the JSON object found in the first choice.
///
/// Responses whose content is not valid JSON are retried up to three times. Transport and HTTP
/// status errors return immediately.
pub async fn complete_json(
	cfg: &lore_config::LlmProviderConfig,
	messages: &[Value],
) -> Result<Value> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let headers = crate::auth_headers(&cfg.api_key, &cfg.default_headers)?;
	let body = serde_json::json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": messages,
		"response_format": { "type": "json_object" },
	});
	let mut last_err = None;

	for _ in 0..MAX_ATTEMPTS {
		let res = client.post(&url).headers(headers.clone()).json(&body).send().await?;
		let json: Value = res.error_for_status()?.json().await?;

		match parse_completion_json(json) {
			Ok(parsed) => return Ok(parsed),
			Err(err) => last_err = Some(err),
		}
	}

	Err(last_err.unwrap_or_else(|| Error::InvalidResponse {
		message: "Insight response is not valid JSON.".to_string(),
	}))
}

/// Accepts either an OpenAI-style completion envelope or a bare JSON object.
fn parse_completion_json(json: Value) -> Result<Value> {
	if let Some(content) = json.pointer("/choices/0/message/content").and_then(Value::as_str) {
		return serde_json::from_str(strip_code_fence(content)).map_err(|err| {
			Error::InvalidResponse { message: format!("Insight content is not valid JSON: {err}.") }
		});
	}
	if json.is_object() && json.get("choices").is_none() {
		return Ok(json);
	}

	Err(Error::InvalidResponse { message: "Insight response is missing JSON content.".to_string() })
}

fn strip_code_fence(content: &str) -> &str {
	let trimmed = content.trim();
	let Some(rest) = trimmed.strip_prefix("```") else {
		return trimmed;
	};
	let rest = rest.strip_prefix("json").unwrap_or(rest);

	rest.strip_suffix("```").unwrap_or(rest).trim()
}
