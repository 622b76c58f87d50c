use base64::Engine as _;

pub const DEFAULT_GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models";

/// One party in a conversation. Gemini only distinguishes the requesting
/// user from the model itself; system text is sent as a user part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn from_str(role_str: &str) -> Option<Self> {
        match role_str.trim().to_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "model" | "ai" | "assistant" => Some(Role::Model),
            _ => None,
        }
    }
}

/// A single content part of a request message.
#[derive(Clone, Debug)]
pub enum MessagePart {
    Text(String),
    InlineImage { data_b64: String, mime_type: String },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text(text.into())
    }

    pub fn image_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        MessagePart::InlineImage {
            data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self { role, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![MessagePart::text(text)])
    }
}

/// A classified piece of streamed response content. Every chunk the API
/// returns is reduced to one of these before callers see it, so nothing
/// downstream has to inspect raw wire parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamPart {
    Image { bytes: Vec<u8>, mime_type: String },
    Text(String),
}

/// Credentials and target model for the Gemini API.
#[derive(Clone, Debug)]
pub struct GeminiClient {
    pub(crate) api_key: String,
    pub(crate) endpoint: String,
    pub(crate) model: String,
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        let model = model.strip_prefix("models/").unwrap_or(&model).to_string();
        Self {
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            model,
        }
    }

    pub fn with_default_endpoint(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(api_key, DEFAULT_GEMINI_ENDPOINT, model)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}
