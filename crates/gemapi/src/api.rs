use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};

use crate::models::GenerateContentResponse;
use crate::types::{GeminiClient, Message, MessagePart, StreamPart};

pub fn convert_parts(parts: &[MessagePart]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| match part {
            MessagePart::Text(text) => json!({ "text": text }),
            MessagePart::InlineImage { data_b64, mime_type } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": data_b64
                }
            }),
        })
        .collect()
}

pub fn convert_messages_to_contents(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "parts": convert_parts(&m.parts)
            })
        })
        .collect()
}

/// Reduce one response chunk to tagged parts. Inline data is base64-decoded
/// here so nothing downstream ever touches the wire encoding; empty parts are
/// dropped.
pub fn classify_response_parts(response: &GenerateContentResponse) -> Result<Vec<StreamPart>> {
    let mut out = Vec::new();

    for candidate in &response.candidates {
        let Some(content) = &candidate.content else {
            continue;
        };
        for part in &content.parts {
            if let Some(inline_data) = &part.inline_data {
                let data = inline_data.data.trim();
                if data.is_empty() {
                    continue;
                }
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .context("Base64 decoding of inline image data failed")?;
                let mime_type = inline_data
                    .mime_type
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or("image/png")
                    .to_string();
                out.push(StreamPart::Image { bytes, mime_type });
            } else if let Some(text) = &part.text {
                if !text.is_empty() {
                    out.push(StreamPart::Text(text.clone()));
                }
            }
        }
    }

    Ok(out)
}

/// Reassembles SSE lines from network chunks. Bytes are buffered raw and
/// only complete lines are decoded, so a multi-byte character split across
/// two chunks comes back intact.
#[derive(Debug, Default)]
struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    /// Append one network chunk and drain every line it completes.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream ends, a trailing line without a
    /// final newline.
    fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

/// Parse one line of the SSE body. Comment lines, keep-alives, and anything
/// that is not a JSON chunk come back as `None`.
fn parse_stream_line(line: &str) -> Option<GenerateContentResponse> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line.strip_prefix("data:").unwrap_or(line).trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    serde_json::from_str(payload).ok()
}

/// Issue a streamed `streamGenerateContent` call and collect the classified
/// parts in arrival order.
pub async fn stream_generate(
    api_client: &GeminiClient,
    messages: &[Message],
) -> Result<Vec<StreamPart>> {
    let endpoint = api_client.endpoint().trim_end_matches('/');
    let url = format!(
        "{}/{}:streamGenerateContent?alt=sse",
        endpoint,
        api_client.model()
    );

    let body = json!({
        "contents": convert_messages_to_contents(messages),
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"]
        }
    });

    let client = Client::new();
    let response = client
        .post(&url)
        .header("x-goog-api-key", api_client.api_key())
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = response.status();
    if !status.is_success() {
        let response_text = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "Gemini streamGenerateContent failed: status {} body {}",
            status,
            response_text
        ));
    }

    let mut parts: Vec<StreamPart> = Vec::new();
    let mut buffer = SseLineBuffer::default();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.context("Reading response stream failed")?;
        for line in buffer.feed(&bytes) {
            if let Some(chunk) = parse_stream_line(&line) {
                check_prompt_feedback(&chunk)?;
                parts.extend(classify_response_parts(&chunk)?);
            }
        }
    }

    if let Some(line) = buffer.finish() {
        if let Some(chunk) = parse_stream_line(&line) {
            check_prompt_feedback(&chunk)?;
            parts.extend(classify_response_parts(&chunk)?);
        }
    }

    Ok(parts)
}

fn check_prompt_feedback(chunk: &GenerateContentResponse) -> Result<()> {
    if let Some(feedback) = &chunk.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Err(anyhow!("Prompt was blocked by the API: {}", reason));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn contents_carry_roles_and_parts() {
        let messages = vec![
            Message::user_text("draw a red circle"),
            Message::model_text("here you go"),
            Message::new(
                Role::User,
                vec![
                    MessagePart::text("again, but blue"),
                    MessagePart::image_bytes(b"png-bytes", "image/png"),
                ],
            ),
        ];

        let contents = convert_messages_to_contents(&messages);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "draw a red circle");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            contents[2]["parts"][1]["inlineData"]["mimeType"],
            "image/png"
        );
        assert_eq!(
            contents[2]["parts"][1]["inlineData"]["data"],
            "cG5nLWJ5dGVz"
        );
    }

    #[test]
    fn stream_line_strips_sse_framing() {
        let chunk = parse_stream_line(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"hi"}],"role":"model"}}]}"#,
        )
        .expect("chunk should parse");
        assert_eq!(chunk.candidates.len(), 1);

        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line(": keep-alive").is_none());
        assert!(parse_stream_line("data: [DONE]").is_none());
        assert!(parse_stream_line("data: not-json").is_none());
    }

    #[test]
    fn lines_split_across_chunks_reassemble() {
        let line = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n";

        let mut buffer = SseLineBuffer::default();
        assert!(buffer.feed(&line.as_bytes()[..20]).is_empty());
        let lines = buffer.feed(&line.as_bytes()[20..]);
        assert_eq!(lines.len(), 1);
        assert!(parse_stream_line(&lines[0]).is_some());
    }

    #[test]
    fn multibyte_text_survives_a_chunk_boundary() {
        let line = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"猫です\"}]}}]}\n";
        let bytes = line.as_bytes();
        // One byte into the three-byte encoding of 猫.
        let cut = line.find('猫').unwrap() + 1;

        let mut buffer = SseLineBuffer::default();
        assert!(buffer.feed(&bytes[..cut]).is_empty());
        let lines = buffer.feed(&bytes[cut..]);
        assert_eq!(lines.len(), 1);

        let chunk = parse_stream_line(&lines[0]).expect("chunk should parse");
        let parts = classify_response_parts(&chunk).unwrap();
        assert_eq!(parts, vec![StreamPart::Text("猫です".into())]);
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.feed(b"data: [DONE]").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));

        assert!(SseLineBuffer::default().finish().is_none());
    }

    #[test]
    fn classification_tags_image_and_text_parts() {
        let raw = r#"{
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "a red circle"},
                        {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}},
                        {"text": ""}
                    ]
                }
            }]
        }"#;
        let chunk: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        let parts = classify_response_parts(&chunk).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], StreamPart::Text("a red circle".into()));
        assert_eq!(
            parts[1],
            StreamPart::Image {
                bytes: b"hello".to_vec(),
                mime_type: "image/png".into()
            }
        );
    }

    #[test]
    fn classification_defaults_missing_mime_to_png() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"inlineData":{"data":"aGVsbG8="}}]}}]}"#;
        let chunk: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        let parts = classify_response_parts(&chunk).unwrap();
        assert_eq!(
            parts[0],
            StreamPart::Image {
                bytes: b"hello".to_vec(),
                mime_type: "image/png".into()
            }
        );
    }

    #[test]
    fn classification_rejects_corrupt_base64() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"inlineData":{"data":"%%%"}}]}}]}"#;
        let chunk: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert!(classify_response_parts(&chunk).is_err());
    }

    #[test]
    fn usage_only_chunk_classifies_to_nothing() {
        let raw = r#"{"usageMetadata":{"totalTokenCount":42}}"#;
        let chunk: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert!(classify_response_parts(&chunk).unwrap().is_empty());
    }
}
