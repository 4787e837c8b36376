use std::sync::Arc;

use spotguard_providers::MarketplaceProvider;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        std::env::var("PROVIDER").unwrap_or_else(|_| "vastai".to_string())
    }

    /// Provider implementations are compiled in through the `provider-*` features.
    pub fn get_provider(provider_name: &str) -> Option<Arc<dyn MarketplaceProvider>> {
        match provider_name.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-vastai")]
            "vastai" => {
                let api_key = crate::config::env_secret("VASTAI_API_KEY")?;
                let base_url = std::env::var("VASTAI_API_URL")
                    .unwrap_or_else(|_| spotguard_providers::vastai::DEFAULT_BASE_URL.to_string());
                match spotguard_providers::vastai::VastAiProvider::new(&base_url, api_key) {
                    Ok(p) => Some(Arc::new(p)),
                    Err(e) => {
                        tracing::error!("❌ vastai provider init failed: {:?}", e);
                        None
                    }
                }
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(spotguard_providers::mock::MockMarketplace::new())),
            other => {
                tracing::error!(
                    "❌ provider '{}' unknown or not compiled in (enable the provider-{} feature)",
                    other,
                    other
                );
                None
            }
        }
    }
}
