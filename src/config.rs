use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    pub api_key: String,
    pub vision_model: String,
    pub image_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub ai: AiConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "platelog".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "platelog-users".into()),
            ttl_minutes: std::env::var("JWT_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60 * 24),
        };
        let ai = AiConfig {
            api_key: std::env::var("OPENAI_API_KEY")?,
            vision_model: std::env::var("VISION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            image_model: std::env::var("IMAGE_MODEL").unwrap_or_else(|_| "dall-e-3".into()),
        };
        let storage = StorageConfig {
            endpoint: std::env::var("S3_ENDPOINT")?,
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "platelog-photos".into()),
            access_key: std::env::var("S3_ACCESS_KEY")?,
            secret_key: std::env::var("S3_SECRET_KEY")?,
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
        };
        Ok(Self {
            database_url,
            jwt,
            ai,
            storage,
        })
    }
}
