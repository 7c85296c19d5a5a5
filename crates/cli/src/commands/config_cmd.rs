//! `switchboard config`: configuration inspection.

use switchboard_config::AppConfig;

/// Print the effective configuration (file, then env overrides) as TOML.
pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", render(&config)?);
    if !config.has_api_key() {
        eprintln!("# No API key set (SWITCHBOARD_API_KEY or OPENAI_API_KEY)");
    }
    Ok(())
}

pub fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

pub fn defaults() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", AppConfig::default_toml());
    Ok(())
}

/// TOML form of `config` with the API key masked.
fn render(config: &AppConfig) -> Result<String, toml::ser::Error> {
    let mut masked = config.clone();
    if masked.provider.api_key.is_some() {
        masked.provider.api_key = Some("********".into());
    }
    toml::to_string_pretty(&masked)
}
