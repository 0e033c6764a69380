use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OracleConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Reply from one oracle consultation.
///
/// Oracle unavailability is reported in-band (`success == false`) rather than
/// as an error so callers can treat the oracle as strictly advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleAnswer {
    pub text: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl OracleAnswer {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            success: false,
            error_message: Some(message.into()),
        }
    }
}

/// External advisory service consulted for adaptation decisions.
/// Implementations must never panic; failures are folded into the answer.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn ask(&self, prompt: &str) -> OracleAnswer;
}

// ============================================================================
// HTTP oracle
// ============================================================================

#[derive(Debug, Serialize)]
struct AskRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AskResponse {
    #[serde(default)]
    text: String,
}

/// Oracle backed by a remote HTTP endpoint.
pub struct HttpOracle {
    client: reqwest::Client,
    config: OracleConfig,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post_prompt(&self, url: &str, prompt: &str) -> anyhow::Result<String> {
        let body = AskRequest {
            prompt,
            model: self.config.model.as_deref(),
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("oracle returned {}: {}", status, detail);
        }

        // Prefer a structured {"text": ...} body, fall back to raw text.
        let raw = response.text().await?;
        match serde_json::from_str::<AskResponse>(&raw) {
            Ok(parsed) if !parsed.text.is_empty() => Ok(parsed.text),
            _ => Ok(raw),
        }
    }
}

#[async_trait]
impl DecisionOracle for HttpOracle {
    async fn ask(&self, prompt: &str) -> OracleAnswer {
        let Some(url) = self.config.url.clone() else {
            return OracleAnswer::failure("oracle url is not configured");
        };

        match self.post_prompt(&url, prompt).await {
            Ok(text) => OracleAnswer::reply(text),
            Err(e) => OracleAnswer::failure(e.to_string()),
        }
    }
}

// ============================================================================
// Canned oracle
// ============================================================================

/// In-process oracle that replays scripted answers, for tests and dry runs.
/// Replies are consumed in order; once exhausted, the last answer repeats.
pub struct CannedOracle {
    answers: Mutex<VecDeque<OracleAnswer>>,
    last: Mutex<OracleAnswer>,
}

impl CannedOracle {
    pub fn new(replies: Vec<&str>) -> Self {
        let answers: VecDeque<OracleAnswer> =
            replies.into_iter().map(OracleAnswer::reply).collect();
        let last = answers
            .back()
            .cloned()
            .unwrap_or_else(|| OracleAnswer::reply(""));
        Self {
            answers: Mutex::new(answers),
            last: Mutex::new(last),
        }
    }

    /// Oracle that always reports itself unavailable.
    pub fn unavailable(message: &str) -> Self {
        let answer = OracleAnswer::failure(message);
        Self {
            answers: Mutex::new(VecDeque::new()),
            last: Mutex::new(answer),
        }
    }
}

#[async_trait]
impl DecisionOracle for CannedOracle {
    async fn ask(&self, _prompt: &str) -> OracleAnswer {
        let mut answers = match self.answers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(answer) = answers.pop_front() {
            if let Ok(mut last) = self.last.lock() {
                *last = answer.clone();
            }
            return answer;
        }
        match self.last.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canned_oracle_replays_in_order_then_repeats() {
        let oracle = CannedOracle::new(vec!["retry the flow", "no adaptation needed"]);
        assert_eq!(oracle.ask("ignored").await.text, "retry the flow");
        assert_eq!(oracle.ask("ignored").await.text, "no adaptation needed");
        assert_eq!(oracle.ask("ignored").await.text, "no adaptation needed");
    }

    #[tokio::test]
    async fn unavailable_oracle_reports_failure_in_band() {
        let oracle = CannedOracle::unavailable("connection refused");
        let answer = oracle.ask("anything").await;
        assert!(!answer.success);
        assert_eq!(answer.error_message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn http_oracle_without_url_degrades() {
        let oracle = HttpOracle::new(OracleConfig::default());
        let answer = oracle.ask("should we adapt?").await;
        assert!(!answer.success);
    }
}
