//! LLM transport implementations for Switchboard.
//!
//! All providers implement the `switchboard_core::Provider` trait.

pub mod openai_compat;

use std::sync::Arc;
use switchboard_config::AppConfig;
use switchboard_core::error::ProviderError;
use switchboard_core::provider::Provider;

pub use openai_compat::OpenAiCompatProvider;

/// Build the configured provider.
///
/// Local endpoints (Ollama and friends) run without a key; anything else
/// must have one from the config file or the environment.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let section = &config.provider;
    let is_local = section.api_url.contains("localhost") || section.api_url.contains("127.0.0.1");

    let api_key = match (&section.api_key, is_local) {
        (Some(key), _) => key.clone(),
        (None, true) => String::new(),
        (None, false) => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{}' (set SWITCHBOARD_API_KEY or provider.api_key)",
                section.name
            )));
        }
    };

    let provider = OpenAiCompatProvider::new(section.name.clone(), section.api_url.clone(), api_key)?;
    tracing::debug!(provider = %section.name, url = %section.api_url, "Provider configured");
    Ok(Arc::new(provider))
}
