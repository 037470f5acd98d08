use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub video_provider_app_id: String,
    pub video_provider_api_token: String,
    pub video_provider_base_url: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            video_provider_app_id: env::var("VIDEO_PROVIDER_APP_ID")
                .unwrap_or_else(|_| {
                    warn!("VIDEO_PROVIDER_APP_ID not set, using empty value");
                    String::new()
                }),
            video_provider_api_token: env::var("VIDEO_PROVIDER_API_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("VIDEO_PROVIDER_API_TOKEN not set, using empty value");
                    String::new()
                }),
            video_provider_base_url: env::var("VIDEO_PROVIDER_BASE_URL")
                .unwrap_or_else(|_| {
                    warn!("VIDEO_PROVIDER_BASE_URL not set, using default");
                    "https://rtc.live.cloudflare.com/v1".to_string()
                }),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_video_provider_configured(&self) -> bool {
        !self.video_provider_app_id.is_empty()
            && !self.video_provider_api_token.is_empty()
            && !self.video_provider_base_url.is_empty()
    }
}
