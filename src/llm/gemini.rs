use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{
    RenderEngine, CONFIG, IDENTITY_DIRECTIVE, PROMPT_ASSISTANT_SYSTEM_PROMPT, STYLE_DIRECTIVE,
};
use crate::llm::media::ImagePayload;
use crate::studio::glossary::{glossary_prompt_block, StyleGlossary};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    Text {
        text: String,
    },
    #[allow(dead_code)]
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

impl GeminiResponse {
    fn parts(&self) -> impl Iterator<Item = &GeminiPart> {
        self.candidates
            .iter()
            .flatten()
            .filter_map(|candidate| candidate.content.as_ref())
            .filter_map(|content| content.parts.as_ref())
            .flatten()
    }
}

/// What a model call produced, decoded once at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeminiOutcome {
    Image { bytes: Vec<u8>, mime_type: String },
    Text(String),
    Empty,
    Failure(String),
}

/// Everything one generation call needs, snapshotted out of the session.
#[derive(Debug, Clone)]
pub struct ImageGenerationRequest {
    pub engine: RenderEngine,
    pub persona_name: String,
    pub aspect_ratio: String,
    pub scene: String,
    pub identity: Vec<ImagePayload>,
    pub style: Vec<ImagePayload>,
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "OFF",
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}', using standard defaults.",
                profile
            );
            "BLOCK_MEDIUM_AND_ABOVE"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
    ]
}

fn with_safety_settings(mut payload: Value, profile: &str) -> Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "safetySettings".to_string(),
            Value::Array(build_safety_settings(profile)),
        );
    }
    payload
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_gemini_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_gemini_payload(payload: &Value, system_prompt_label: Option<&str>) -> Value {
    let mut summary = Map::new();

    if payload.pointer("/systemInstruction").is_some() {
        let label = system_prompt_label.unwrap_or("inline_system_prompt");
        summary.insert(
            "systemInstruction".to_string(),
            Value::String(label.to_string()),
        );
    }

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let summarized: Vec<Value> = contents
            .iter()
            .map(|content| {
                let parts = content
                    .get("parts")
                    .and_then(|value| value.as_array())
                    .map(|parts| summarize_gemini_parts(parts))
                    .unwrap_or_default();
                json!({ "role": content.get("role").cloned().unwrap_or(json!("user")), "parts": parts })
            })
            .collect();
        summary.insert("contents".to_string(), Value::Array(summarized));
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    Value::Object(summary)
}

fn summarize_gemini_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut other_parts = 0usize;
    let mut text_preview = None;

    for part in response.parts() {
        match part {
            GeminiPart::Text { text } => {
                text_parts += 1;
                if text_preview.is_none() && !text.trim().is_empty() {
                    text_preview = Some(truncate_for_log(text, 200));
                }
            }
            GeminiPart::InlineData { .. } => image_parts += 1,
            GeminiPart::Other(_) => other_parts += 1,
        }
    }

    json!({
        "candidates": response.candidates.as_ref().map(|candidates| candidates.len()).unwrap_or(0),
        "textParts": text_parts,
        "inlineParts": image_parts,
        "otherParts": other_parts,
        "textPreview": text_preview
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

/// First inline binary part wins. Text-only responses surface the model's
/// explanation so the operator can see why no image came back.
pub fn image_outcome(response: &GeminiResponse) -> GeminiOutcome {
    let mut saw_part = false;
    let mut texts = Vec::new();
    for part in response.parts() {
        saw_part = true;
        match part {
            GeminiPart::InlineData { inline_data } => {
                return match general_purpose::STANDARD.decode(inline_data.data.trim()) {
                    Ok(bytes) if !bytes.is_empty() => GeminiOutcome::Image {
                        bytes,
                        mime_type: inline_data.mime_type.clone(),
                    },
                    Ok(_) => GeminiOutcome::Failure("inline image data is empty".to_string()),
                    Err(err) => {
                        GeminiOutcome::Failure(format!("inline image data is not base64: {}", err))
                    }
                };
            }
            GeminiPart::Text { text } if !text.trim().is_empty() => texts.push(text.trim()),
            _ => {}
        }
    }

    if !saw_part {
        GeminiOutcome::Empty
    } else if texts.is_empty() {
        GeminiOutcome::Text(String::new())
    } else {
        GeminiOutcome::Text(texts.join("\n"))
    }
}

pub fn text_outcome(response: &GeminiResponse) -> GeminiOutcome {
    let text = response
        .parts()
        .filter_map(|part| match part {
            GeminiPart::Text { text } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        GeminiOutcome::Empty
    } else {
        GeminiOutcome::Text(trimmed.to_string())
    }
}

pub fn build_generation_instruction(persona_name: &str, aspect_ratio: &str, scene: &str) -> String {
    format!(
        "Generate an image of the virtual model \"{persona_name}\".\n\n{IDENTITY_DIRECTIVE}\n\n{STYLE_DIRECTIVE}\n\nTECHNICAL PARAMETERS:\nImage format (aspect ratio): {aspect_ratio}\n\nSCENE DESCRIPTION:\n{}",
        scene.trim()
    )
}

fn inline_image_part(image: &ImagePayload) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": general_purpose::STANDARD.encode(&image.bytes)
        }
    })
}

/// Parts go out as: instruction, identity images, style images. The API has
/// no aspect-ratio field for this call, so the ratio travels in the text.
pub fn build_generation_payload(request: &ImageGenerationRequest) -> Value {
    let instruction =
        build_generation_instruction(&request.persona_name, &request.aspect_ratio, &request.scene);
    let mut parts = vec![json!({ "text": instruction })];
    parts.extend(request.identity.iter().map(inline_image_part));
    parts.extend(request.style.iter().map(inline_image_part));

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE"]
        },
    })
}

pub fn build_assistant_system_prompt(persona_name: &str, glossary: Option<&StyleGlossary>) -> String {
    PROMPT_ASSISTANT_SYSTEM_PROMPT
        .replace("{persona}", persona_name)
        .replace("{glossary}", &glossary_prompt_block(glossary))
}

pub fn build_assistant_payload(system_prompt: &str, command: &str, temperature: f32) -> Value {
    json!({
        "systemInstruction": { "parts": [{ "text": system_prompt }] },
        "contents": [{ "role": "user", "parts": [{ "text": command }] }],
        "generationConfig": {
            "temperature": temperature,
            "responseModalities": ["TEXT"]
        },
    })
}

async fn call_gemini_api(
    model: &str,
    payload: Value,
    system_prompt_label: Option<&str>,
) -> Result<GeminiResponse> {
    let client = get_http_client();
    let url = format!("{}/models/{}:generateContent", CONFIG.gemini_base_url, model);

    if tracing::enabled!(tracing::Level::DEBUG) {
        let payload_summary = summarize_gemini_payload(&payload, system_prompt_label);
        debug!(target: "llm.gemini", model = model, payload = %payload_summary);
    }

    let response = client
        .post(&url)
        .header("x-goog-api-key", &CONFIG.gemini_api_key)
        .timeout(Duration::from_secs(CONFIG.gemini_request_timeout_seconds))
        .json(&payload)
        .send()
        .await
        .map_err(|err| {
            warn!(
                "Gemini request failed to send: {} (timeout={}, connect={})",
                err,
                err.is_timeout(),
                err.is_connect()
            );
            anyhow!("Gemini request failed: {}", err)
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let (message, body_summary) = summarize_error_body(&body);
        warn!("Gemini API error: status={}, body={}", status, body_summary);
        let detail = message.unwrap_or(body_summary);
        return Err(anyhow!(
            "Gemini request failed with status {}: {}",
            status,
            detail
        ));
    }

    let value = response.json::<GeminiResponse>().await?;
    if tracing::enabled!(tracing::Level::DEBUG) {
        let response_summary = summarize_gemini_response(&value);
        debug!(target: "llm.gemini", model = model, response = %response_summary);
    }
    Ok(value)
}

/// Submits whatever it is given; validation belongs to the caller.
pub async fn generate_persona_image(request: &ImageGenerationRequest) -> GeminiOutcome {
    let payload = with_safety_settings(
        build_generation_payload(request),
        &CONFIG.gemini_safety_settings,
    );
    let model = request.engine.model.as_str();
    let metadata = json!({
        "identityImages": request.identity.len(),
        "styleImages": request.style.len(),
        "aspectRatio": request.aspect_ratio,
    });

    let result = log_llm_timing("gemini", model, "generate_persona_image", Some(metadata), || async {
        call_gemini_api(model, payload, None).await
    })
    .await;

    match result {
        Ok(response) => image_outcome(&response),
        Err(err) => GeminiOutcome::Failure(err.to_string()),
    }
}

pub async fn call_prompt_assistant(
    command: &str,
    persona_name: &str,
    glossary: Option<&StyleGlossary>,
) -> GeminiOutcome {
    let system_prompt = build_assistant_system_prompt(persona_name, glossary);
    let payload = with_safety_settings(
        build_assistant_payload(&system_prompt, command, CONFIG.gemini_temperature),
        &CONFIG.gemini_safety_settings,
    );
    let model = CONFIG.gemini_assistant_model.as_str();

    let result = log_llm_timing("gemini", model, "prompt_assistant", None, || async {
        call_gemini_api(model, payload, Some("prompt_assistant_system_prompt")).await
    })
    .await;

    match result {
        Ok(response) => text_outcome(&response),
        Err(err) => GeminiOutcome::Failure(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(raw: &str) -> GeminiResponse {
        serde_json::from_str(raw).unwrap()
    }

    fn payload(mime: &str, marker: u8) -> ImagePayload {
        ImagePayload {
            mime_type: mime.to_string(),
            bytes: vec![marker; 3],
        }
    }

    #[test]
    fn first_inline_part_is_returned_in_order() {
        let first = general_purpose::STANDARD.encode([1u8, 2, 3]);
        let second = general_purpose::STANDARD.encode([4u8]);
        let raw = format!(
            r#"{{"candidates":[{{"content":{{"parts":[
                {{"text":"Here she is"}},
                {{"thoughtSignature":"abc"}},
                {{"inlineData":{{"mimeType":"image/png","data":"{first}"}}}},
                {{"inlineData":{{"mimeType":"image/jpeg","data":"{second}"}}}}
            ]}}}}]}}"#
        );

        assert_eq!(
            image_outcome(&response(&raw)),
            GeminiOutcome::Image {
                bytes: vec![1, 2, 3],
                mime_type: "image/png".to_string()
            }
        );
    }

    #[test]
    fn responses_without_parts_are_empty() {
        assert_eq!(image_outcome(&response("{}")), GeminiOutcome::Empty);
        assert_eq!(
            image_outcome(&response(r#"{"candidates":[{"content":{"parts":[]}}]}"#)),
            GeminiOutcome::Empty
        );
        assert_eq!(
            image_outcome(&response(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#)),
            GeminiOutcome::Empty
        );
    }

    #[test]
    fn text_only_image_response_carries_the_explanation() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"I can't render that."}]}}]}"#;
        assert_eq!(
            image_outcome(&response(raw)),
            GeminiOutcome::Text("I can't render that.".to_string())
        );
    }

    #[test]
    fn invalid_base64_is_a_failure() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"@@@"}}]}}]}"#;
        assert!(matches!(image_outcome(&response(raw)), GeminiOutcome::Failure(_)));
    }

    #[test]
    fn text_outcome_trims_and_reports_empty() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"  Valeria walks the Seine.\n"}]}}]}"#;
        assert_eq!(
            text_outcome(&response(raw)),
            GeminiOutcome::Text("Valeria walks the Seine.".to_string())
        );

        let blank = r#"{"candidates":[{"content":{"parts":[{"text":"   "}]}}]}"#;
        assert_eq!(text_outcome(&response(blank)), GeminiOutcome::Empty);
    }

    #[test]
    fn generation_payload_orders_text_identity_then_style() {
        let request = ImageGenerationRequest {
            engine: RenderEngine::new("Fast", "gemini-2.5-flash-image"),
            persona_name: "Valeria Desvelada".to_string(),
            aspect_ratio: "9:16".to_string(),
            scene: "Valeria on a rooftop at dusk".to_string(),
            identity: vec![payload("image/jpeg", 1), payload("image/png", 2)],
            style: vec![payload("image/webp", 3)],
        };

        let value = build_generation_payload(&request);
        let parts = value.pointer("/contents/0/parts").unwrap().as_array().unwrap();
        assert_eq!(parts.len(), 4);

        let instruction = parts[0]["text"].as_str().unwrap();
        assert!(instruction.contains("Valeria Desvelada"));
        assert!(instruction.contains("9:16"));
        assert!(instruction.ends_with("Valeria on a rooftop at dusk"));

        let mimes: Vec<&str> = parts[1..]
            .iter()
            .map(|part| part.pointer("/inlineData/mimeType").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(mimes, vec!["image/jpeg", "image/png", "image/webp"]);
        assert_eq!(
            value.pointer("/generationConfig/responseModalities").unwrap(),
            &json!(["IMAGE"])
        );
        assert!(value.pointer("/generationConfig/imageConfig").is_none());
    }

    #[test]
    fn assistant_prompt_embeds_persona_glossary_and_verbs() {
        let prompt = build_assistant_system_prompt("Valeria Desvelada", None);
        assert!(prompt.contains("\"Valeria Desvelada\" MUST appear"));
        assert!(prompt.contains("(no style glossary loaded)"));
        for verb in ["Improve:", "Fashion Recipe:", "Portrait Recipe:", "Describe:"] {
            assert!(prompt.contains(verb), "missing {verb}");
        }

        let payload = build_assistant_payload(&prompt, "Improve: cafe", 0.7);
        assert_eq!(
            payload.pointer("/contents/0/parts/0/text").unwrap(),
            "Improve: cafe"
        );
        assert!(payload.pointer("/systemInstruction/parts/0/text").is_some());
    }

    #[test]
    fn error_bodies_prefer_api_message() {
        let (message, _) = summarize_error_body(r#"{"error":{"message":"quota exceeded"}}"#);
        assert_eq!(message.as_deref(), Some("quota exceeded"));
        let (message, summary) = summarize_error_body("   ");
        assert!(message.is_none());
        assert_eq!(summary, "empty response body");
    }
}
