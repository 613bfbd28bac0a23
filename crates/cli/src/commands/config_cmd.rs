//! `tidewire config`: Configuration management commands.

use tidewire_config::AppConfig;

pub fn validate() -> anyhow::Result<()> {
    println!("🔍 Validating configuration...");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let mut warnings = Vec::new();
    if !config.context_guard.enabled {
        warnings.push("Context guard disabled; overflowing requests go out unchanged");
    }
    if !config.fallback.enabled {
        warnings.push("Model fallback disabled");
    }
    if config.backend.stream_timeout_ms < config.backend.request_timeout_ms {
        warnings.push("stream_timeout_ms is shorter than request_timeout_ms");
    }

    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Backend:   {}", config.backend.base_url);
    println!(
        "   Model:     {}",
        config.model.default_model.as_deref().unwrap_or("(backend default)")
    );
    println!("   Scenario:  {}", config.model.scenario_profile);
    println!("   Fallback:  {}", config.fallback.profile());
    println!("   API key:   {}", if config.has_api_key() { "set" } else { "none" });
    Ok(())
}

pub fn show() -> anyhow::Result<()> {
    let mut config = AppConfig::load()?;
    if config.backend.api_key.is_some() {
        config.backend.api_key = Some("***".into());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}
