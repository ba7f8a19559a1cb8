use anyhow::Context;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageUrlArgs,
        ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;

use super::{NutritionAnalyzer, NutritionEstimate, RawEstimate};

const SYSTEM_INSTRUCTIONS: &str = r#"You are a nutrition estimation service. Given a meal photo and/or a text description, estimate the nutrition facts for the whole pictured serving.

Respond with a single JSON object and nothing else, using exactly these keys:
{
  "calories": number,
  "fat_g": number,
  "carbs_g": number,
  "protein_g": number,
  "food_name": string or null,
  "brand_name": string or null,
  "quantity": number or null,
  "unit": "grams" | "ounces" | "count" | null
}

Rules:
- Estimate for everything visible/described, not per 100g.
- food_name is a short dish name ("Caesar Salad"), brand_name only if a
  commercial brand is clearly identifiable, otherwise null.
- quantity/unit describe the serving ("2" + "count" for two slices,
  "350" + "grams" for a weighed portion). Use null when unsure.
- Never refuse; give your best estimate."#;

/// Nutrition analyzer backed by an OpenAI-compatible vision model.
#[derive(Clone)]
pub struct OpenAiAnalyzer {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

/// Models occasionally wrap the JSON in a markdown fence even in JSON
/// mode; cut down to the outermost object before parsing.
fn extract_json(reply: &str) -> &str {
    match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if end > start => &reply[start..=end],
        _ => reply,
    }
}

#[async_trait]
impl NutritionAnalyzer for OpenAiAnalyzer {
    async fn analyze(
        &self,
        image: Option<Bytes>,
        description: Option<&str>,
    ) -> anyhow::Result<NutritionEstimate> {
        let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();

        let prompt = match description {
            Some(desc) => format!("Estimate the nutrition of this meal: {desc}"),
            None => "Estimate the nutrition of the pictured meal.".to_string(),
        };
        parts.push(ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(prompt)
                .build()?,
        ));

        if let Some(bytes) = image {
            let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes));
            parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(ImageUrlArgs::default().url(data_url).build()?)
                    .build()?,
            ));
        }

        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_INSTRUCTIONS)
                    .build()?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(parts))
                    .build()?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .response_format(ResponseFormat::JsonObject)
            .max_tokens(300u32)
            .build()?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("nutrition analysis request")?;

        let reply = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .context("empty analyzer reply")?;

        let raw: RawEstimate =
            serde_json::from_str(extract_json(&reply)).context("malformed analyzer reply")?;
        Ok(NutritionEstimate::from_raw(raw))
    }
}

#[cfg(test)]
mod analyzer_tests {
    use super::*;

    #[test]
    fn test_extract_json_strips_fences() {
        let fenced = "```json\n{\"calories\": 100}\n```";
        assert_eq!(extract_json(fenced), "{\"calories\": 100}");
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn test_raw_reply_parses() {
        let reply = r#"{"calories": 420.2, "fat_g": 13, "carbs_g": 52, "protein_g": 18,
            "food_name": "Pasta Bolognese", "brand_name": null, "quantity": 1, "unit": "count"}"#;
        let raw: RawEstimate = serde_json::from_str(reply).unwrap();
        let est = NutritionEstimate::from_raw(raw);
        assert_eq!(est.calories, 420);
        assert_eq!(est.food_name.as_deref(), Some("Pasta Bolognese"));
        assert_eq!(est.brand_name, None);
    }

    #[test]
    fn test_partial_reply_parses() {
        // Missing keys must not fail the whole analysis.
        let raw: RawEstimate = serde_json::from_str(r#"{"calories": 90}"#).unwrap();
        let est = NutritionEstimate::from_raw(raw);
        assert_eq!(est.calories, 90);
        assert_eq!(est.protein_g, 0);
        assert_eq!(est.unit, None);
    }
}
