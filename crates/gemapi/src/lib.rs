pub mod api;
pub mod models;
pub mod types;
pub mod utils;

pub use api::{classify_response_parts, convert_messages_to_contents, stream_generate};
pub use types::{DEFAULT_GEMINI_ENDPOINT, GeminiClient, Message, MessagePart, Role, StreamPart};
