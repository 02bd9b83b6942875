use std::{
    env,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::settings::{LlmProvider, LlmSettings};

static DECODING_PARAMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(temperature|top_p|unsupported)").expect("decoding regex is valid")
});

const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[derive(Debug, thiserror::Error)]
pub(crate) enum LlmError {
    #[error("rate limited by the model provider")]
    RateLimited,
    #[error("missing or rejected model credentials")]
    InvalidCredentials,
    #[error("model provider error: {message}")]
    Provider {
        status: Option<u16>,
        message: String,
    },
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Returns `true` if the provider refused the deterministic decoding
    /// parameters rather than the request itself.
    pub(crate) fn rejects_decoding_params(&self) -> bool {
        let LlmError::Provider { message, .. } = self else {
            return false;
        };
        DECODING_PARAMS.is_match(message)
    }
}

/// A chat-style model that turns a system and a user prompt into text.
#[async_trait]
pub(crate) trait LanguageModel: Send + Sync {
    /// With `deterministic` set, the call asks for temperature 0 and top-p 1.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deterministic: bool,
    ) -> Result<String, LlmError>;
}

/// Shared model access with a hard deadline and the decoding fallback.
#[derive(Clone)]
pub(crate) struct ModelHandle {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl ModelHandle {
    pub(crate) fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Calls the model in deterministic mode, retrying once with the
    /// provider's default decoding if the parameters are rejected.
    pub(crate) async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        match self.call(system_prompt, user_prompt, true).await {
            Err(e) if e.rejects_decoding_params() => {
                info!("model rejected deterministic decoding, retrying with defaults: {e}");
                self.call(system_prompt, user_prompt, false).await
            }
            result => result,
        }
    }

    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deterministic: bool,
    ) -> Result<String, LlmError> {
        tokio::time::timeout(
            self.timeout,
            self.model.complete(system_prompt, user_prompt, deterministic),
        )
        .await
        .map_err(|_| LlmError::Timeout(self.timeout))?
    }
}

/// Any OpenAI-compatible `/chat/completions` endpoint.
pub(crate) struct ChatCompletionsClient {
    client: Client,
    api_base: String,
    model: String,
    api_key_env: String,
}

impl ChatCompletionsClient {
    pub(crate) fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        Ok(Self {
            client: http_client(settings.timeout())?,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key_env: settings.api_key_env.clone(),
        })
    }

    fn api_key(&self) -> Result<String, LlmError> {
        env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::InvalidCredentials)
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deterministic: bool,
    ) -> Result<String, LlmError> {
        let api_key = self.api_key()?;
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });
        if deterministic {
            body["temperature"] = json!(0);
            body["top_p"] = json!(1);
        }
        debug!(model = %self.model, deterministic, "calling chat completions");
        let res = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let json = checked_json(res).await?;
        parse_chat_completion(&json)
    }
}

/// A local Ollama server through its native chat API.
pub(crate) struct OllamaClient {
    client: Client,
    api_base: String,
    model: String,
}

impl OllamaClient {
    pub(crate) fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        Ok(Self {
            client: http_client(settings.timeout())?,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deterministic: bool,
    ) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });
        if deterministic {
            body["options"] = json!({ "temperature": 0, "top_p": 1 });
        }
        debug!(model = %self.model, deterministic, "calling ollama chat");
        let res = self
            .client
            .post(format!("{}/api/chat", self.api_base))
            .json(&body)
            .send()
            .await?;
        let json = checked_json(res).await?;
        parse_ollama_chat(&json)
    }
}

pub(crate) fn build_model(settings: &LlmSettings) -> Result<ModelHandle, LlmError> {
    let model: Arc<dyn LanguageModel> = match settings.provider {
        LlmProvider::Openai => Arc::new(ChatCompletionsClient::new(settings)?),
        LlmProvider::Ollama => Arc::new(OllamaClient::new(settings)?),
    };
    Ok(ModelHandle::new(model, settings.timeout()))
}

fn http_client(timeout: Duration) -> Result<Client, LlmError> {
    Ok(Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(timeout)
        .build()?)
}

async fn checked_json(res: reqwest::Response) -> Result<Value, LlmError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json().await?);
    }
    let body = res.text().await.unwrap_or_default();
    Err(classify(status, &body))
}

fn classify(status: StatusCode, body: &str) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::InvalidCredentials,
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited,
        _ => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|json| {
                    let error = json.get("error")?;
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .or_else(|| error.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| body.trim().to_string());
            LlmError::Provider {
                status: Some(status.as_u16()),
                message,
            }
        }
    }
}

fn parse_chat_completion(json: &Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| LlmError::InvalidResponse("chat completion has no message content".into()))
}

fn parse_ollama_chat(json: &Value) -> Result<String, LlmError> {
    if let Some(error) = json.get("error").and_then(Value::as_str) {
        return Err(LlmError::Provider {
            status: None,
            message: error.to_string(),
        });
    }
    json.get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| LlmError::InvalidResponse("ollama reply has no message content".into()))
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{testing::ScriptedModel, *};

    #[test]
    fn reads_choice_content() {
        let json = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "  {\"filters\": {}}\n" } }
            ]
        });
        assert_eq!(parse_chat_completion(&json).unwrap(), "{\"filters\": {}}");
        assert!(matches!(
            parse_chat_completion(&json!({ "choices": [] })),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn reads_ollama_content() {
        let json = json!({ "message": { "role": "assistant", "content": "hi" }, "done": true });
        assert_eq!(parse_ollama_chat(&json).unwrap(), "hi");
        assert!(matches!(
            parse_ollama_chat(&json!({ "error": "model not found" })),
            Err(LlmError::Provider { status: None, .. })
        ));
    }

    #[test]
    fn classifies_provider_failures() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, ""),
            LlmError::InvalidCredentials
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::RateLimited
        ));
        let error = classify(
            StatusCode::BAD_REQUEST,
            r#"{"error": {"message": "Unsupported value: 'temperature' does not support 0"}}"#,
        );
        assert!(error.rejects_decoding_params());
        let error = classify(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(!error.rejects_decoding_params());
        assert!(!LlmError::RateLimited.rejects_decoding_params());
    }

    #[tokio::test]
    async fn retries_once_without_deterministic_decoding() {
        let model = ScriptedModel::new(vec![
            Err(LlmError::Provider {
                status: Some(400),
                message: "temperature is not supported by this model".into(),
            }),
            Ok("answer".into()),
        ]);
        assert_eq!(model.handle().complete("sys", "user").await.unwrap(), "answer");
        let calls = model.calls.lock().unwrap().clone();
        assert_eq!(calls.iter().map(|c| c.1).collect::<Vec<_>>(), vec![true, false]);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let model = ScriptedModel::new(vec![Err(LlmError::RateLimited), Ok("late".into())]);
        assert!(matches!(
            model.handle().complete("sys", "user").await,
            Err(LlmError::RateLimited)
        ));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_api_key_is_invalid_credentials() {
        let settings = LlmSettings {
            api_key_env: "MOVIE_STUDY_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmSettings::default()
        };
        let client = ChatCompletionsClient::new(&settings).unwrap();
        assert!(matches!(
            client.complete("sys", "user", true).await,
            Err(LlmError::InvalidCredentials)
        ));
    }

    struct Stalled;

    #[async_trait]
    impl LanguageModel for Stalled {
        async fn complete(&self, _: &str, _: &str, _: bool) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn calls_are_bounded_by_the_timeout() {
        let handle = ModelHandle::new(Arc::new(Stalled), Duration::from_millis(20));
        assert!(matches!(
            handle.complete("sys", "user").await,
            Err(LlmError::Timeout(_))
        ));
    }
}
