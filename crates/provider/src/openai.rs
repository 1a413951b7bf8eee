use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use types::{
    Context, FunctionDecl, Message, MessageRole, Provider, ProviderError, ProviderId,
    ProviderStream, StreamEvent, ToolCall, ToolParameterSchema,
};

use crate::{
    CHAT_COMPLETIONS_PATH, DEFAULT_STREAM_BUFFER_SIZE, LOCAL_DEFAULT_BASE_URL,
    extract_http_error_message, normalize_base_url_or_default, stream::StreamParser,
};

/// Streaming client for any server that speaks the OpenAI chat-completions
/// wire format (llama.cpp, vLLM, Ollama's compatibility layer, ...).
#[derive(Debug, Clone)]
pub struct OpenAICompatibleProvider {
    client: Client,
    provider_id: ProviderId,
    base_url: String,
    api_key: Option<String>,
    extra_headers: BTreeMap<String, String>,
}

impl OpenAICompatibleProvider {
    pub fn new(
        provider_id: ProviderId,
        base_url: &str,
        api_key: Option<String>,
        extra_headers: BTreeMap<String, String>,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| ProviderError::RequestFailed {
                provider: provider_id.clone(),
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self {
            client,
            provider_id,
            base_url: normalize_base_url_or_default(base_url, LOCAL_DEFAULT_BASE_URL),
            api_key,
            extra_headers,
        })
    }

    pub fn chat_completions_url(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH)
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        for (key, value) in &self.extra_headers {
            builder = builder.header(key, value);
        }
        builder
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    async fn stream(
        &self,
        context: &Context,
        buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError> {
        tracing::debug!(
            provider = %self.provider_id,
            model = %context.model,
            messages = context.messages.len(),
            tools = context.tools.len(),
            "sending chat completion streaming request"
        );

        let request = ChatCompletionRequest::from_context(context);
        let mut http_response = self
            .request(&self.chat_completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|error| ProviderError::Transport {
                provider: self.provider_id.clone(),
                message: error.to_string(),
            })?;

        if !http_response.status().is_success() {
            let status = http_response.status().as_u16();
            let body = match http_response.text().await {
                Ok(text) => text,
                Err(error) => format!("unable to read error body: {error}"),
            };
            return Err(ProviderError::HttpStatus {
                provider: self.provider_id.clone(),
                status,
                message: extract_http_error_message(&body),
            });
        }

        let channel_size = if buffer_size == 0 {
            DEFAULT_STREAM_BUFFER_SIZE
        } else {
            buffer_size
        };
        let (sender, receiver) = mpsc::channel(channel_size);
        let provider = self.provider_id.clone();
        tokio::spawn(async move {
            let mut parser = StreamParser::new();
            loop {
                let chunk = match http_response.chunk().await {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        let _ = sender
                            .send(Err(ProviderError::Transport {
                                provider: provider.clone(),
                                message: format!("stream transport dropped: {error}"),
                            }))
                            .await;
                        return;
                    }
                };
                let Some(chunk) = chunk else {
                    break;
                };

                let (events, done) = parser.push_chunk(&chunk);
                if forward_events(events, &sender).await.is_err() {
                    return;
                }
                if done {
                    tracing::debug!(provider = %provider, "stream reached [DONE] sentinel");
                    return;
                }
            }

            let (events, done) = parser.finish();
            if forward_events(events, &sender).await.is_err() {
                return;
            }
            if !done {
                tracing::debug!(provider = %provider, "stream closed without [DONE] sentinel");
            }
        });

        Ok(receiver)
    }
}

async fn forward_events(
    events: Vec<StreamEvent>,
    sender: &mpsc::Sender<Result<StreamEvent, ProviderError>>,
) -> Result<(), ()> {
    for event in events {
        if sender.send(Ok(event)).await.is_err() {
            // Receiver dropped: the turn was cancelled.
            return Err(());
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessageRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<RequestToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
}

impl ChatCompletionRequest {
    pub(crate) fn from_context(context: &Context) -> Self {
        let tools = context
            .tools
            .iter()
            .map(RequestToolDefinition::from)
            .collect::<Vec<_>>();
        let tool_choice = (!tools.is_empty()).then(|| "auto".to_owned());
        Self {
            model: context.model.0.clone(),
            messages: context
                .messages
                .iter()
                .map(ChatMessageRequest::from)
                .collect(),
            tools,
            tool_choice,
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessageRequest {
    role: &'static str,
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<RequestToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for ChatMessageRequest {
    fn from(value: &Message) -> Self {
        Self {
            role: message_role_to_wire_role(value.role),
            content: value.content.clone(),
            tool_calls: value.tool_calls.iter().map(RequestToolCall::from).collect(),
            tool_call_id: value.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: RequestFunction,
}

impl From<&ToolCall> for RequestToolCall {
    fn from(value: &ToolCall) -> Self {
        Self {
            id: value.id.clone(),
            kind: "function",
            function: RequestFunction {
                name: value.name.clone(),
                arguments: value.arguments.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct RequestToolDefinition {
    #[serde(rename = "type")]
    kind: &'static str,
    function: RequestFunctionDecl,
}

impl From<&FunctionDecl> for RequestToolDefinition {
    fn from(value: &FunctionDecl) -> Self {
        Self {
            kind: "function",
            function: RequestFunctionDecl {
                name: value.name.clone(),
                description: value.description.clone(),
                parameters: value.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestFunctionDecl {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: ToolParameterSchema,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub(crate) error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub(crate) message: String,
}

fn message_role_to_wire_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}
