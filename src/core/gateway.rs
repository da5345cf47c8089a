//! Model Gateway: prompt assembly and the OpenAI-compatible chat transport.
//!
//! The gateway owns the output contract the parser depends on; everything the
//! model is told about the edit grammar lives in `OUTPUT_CONTRACT` so the two
//! sides cannot drift apart silently. Transport failures are passed through
//! opaque — the session surfaces them as a model-unavailable abort without
//! retrying.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::infra::config::ModelConfig;

/// The grammar advertised to the model. Must stay in lockstep with
/// `plan::parse_plan`.
pub const OUTPUT_CONTRACT: &str = r#"Respond ONLY with edit operations in this exact format. No prose, no explanations outside of `#` comment lines.

Operations (in the order they should be applied):

CREATE: <relative/path>
```
<full file content>
```

REPLACE: <relative/path>
```
<full new file content>
```

REPLACE_REGION: <relative/path>
MATCH:
```
<exact text that occurs exactly once in the file>
```
WITH:
```
<replacement text>
```

DELETE: <relative/path>

RENAME: <old/path> -> <new/path>

Rules:
- Paths are relative, forward-slash separated, exactly as listed in the project files section. Never use absolute paths or `..`.
- Every content block is fenced with three or more backticks; use a longer fence when the content itself contains backticks.
- MATCH text must be copied verbatim from the file and must be unambiguous.
- Prefer REPLACE_REGION for small edits; use REPLACE only when most of the file changes.
- Do not touch files that are not part of the request."#;

/// Abstraction over the model transport so sessions can run against stubs
/// in tests.
pub trait ModelClient {
    fn invoke(&self, prompt: &str) -> Result<String, ModelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("API key environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model returned an empty response")]
    EmptyResponse,
}

/// First-turn prompt: contract, serialized snapshot, then the instruction.
pub fn build_prompt(instruction: &str, context: &str) -> String {
    format!(
        "You are an automated code editor. You will be given a project snapshot and an instruction; reply with edit operations only.\n\n\
         # Output format\n\n{OUTPUT_CONTRACT}\n\n\
         # Project snapshot\n\n{context}\n\
         # Instruction\n\n{instruction}\n"
    )
}

/// Corrective retry prompt after a grammar violation. The previous response
/// is truncated so a runaway reply cannot blow up the retry request.
pub fn build_retry_prompt(
    instruction: &str,
    context: &str,
    previous: &str,
    error: &str,
) -> String {
    const PREVIOUS_CAP: usize = 4096;
    let shown = if previous.len() > PREVIOUS_CAP {
        let cut = previous
            .char_indices()
            .take_while(|(i, _)| *i < PREVIOUS_CAP)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}\n[... truncated ...]", &previous[..cut])
    } else {
        previous.to_string()
    };
    format!(
        "{}\n\n\
         # Previous attempt (rejected)\n\n{shown}\n\n\
         # Problem\n\n{error}\n\n\
         Re-send the COMPLETE set of edit operations in the required format, fixing the problem above.\n",
        build_prompt(instruction, context).trim_end()
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Blocking OpenAI-compatible chat completions client. The API key is read
/// from the environment variable named in config and never logged.
#[derive(Debug)]
pub struct HttpModelClient {
    http: reqwest::blocking::Client,
    config: ModelConfig,
    api_key: String,
}

impl HttpModelClient {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = env::var(&config.api_key_env)
            .map_err(|_| ModelError::MissingApiKey(config.api_key_env.clone()))?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
            api_key,
        })
    }
}

impl ModelClient for HttpModelClient {
    fn invoke(&self, prompt: &str) -> Result<String, ModelError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(
            model = %self.config.model,
            prompt_bytes = prompt.len(),
            "sending chat completion request"
        );

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse = response.json()?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(content)
    }
}
