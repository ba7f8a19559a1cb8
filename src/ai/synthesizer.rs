use anyhow::Context;
use async_openai::{
    config::OpenAIConfig,
    types::{CreateImageRequestArgs, Image, ImageModel, ImageResponseFormat, ImageSize},
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;

use super::ImageSynthesizer;

/// Image synthesizer backed by the OpenAI image generation API. Called
/// only for meals that have no user-supplied photo.
#[derive(Clone)]
pub struct OpenAiSynthesizer {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiSynthesizer {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    fn prompt(description: &str, food_name_hint: Option<&str>) -> String {
        let subject = match food_name_hint {
            Some(name) if !name.trim().is_empty() => format!("{name}: {description}"),
            _ => description.to_string(),
        };
        format!(
            "A realistic, appetizing overhead photo of a single plated meal: {subject}. \
             Natural lighting, neutral background, no text or people."
        )
    }
}

#[async_trait]
impl ImageSynthesizer for OpenAiSynthesizer {
    async fn synthesize(
        &self,
        description: &str,
        food_name_hint: Option<&str>,
    ) -> anyhow::Result<Bytes> {
        let request = CreateImageRequestArgs::default()
            .model(ImageModel::Other(self.model.clone()))
            .prompt(Self::prompt(description, food_name_hint))
            .n(1)
            .size(ImageSize::S1024x1024)
            .response_format(ImageResponseFormat::B64Json)
            .build()?;

        let response = self
            .client
            .images()
            .create(request)
            .await
            .context("image synthesis request")?;

        let image = response.data.first().context("empty synthesis reply")?;
        match image.as_ref() {
            Image::B64Json { b64_json, .. } => {
                let bytes = BASE64
                    .decode(b64_json.as_bytes())
                    .context("decode synthesized image")?;
                Ok(Bytes::from(bytes))
            }
            Image::Url { .. } => anyhow::bail!("expected base64 image payload"),
        }
    }
}
