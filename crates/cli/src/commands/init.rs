use std::path::Path;

use margin_core::config::MarginConfig;
use margin_core::crypto;
use margin_core::db::DatabasePool;
use margin_core::signing::ToolKey;
use tracing::info;

/// Build the configuration `init` writes for `data_dir`.
fn initial_config(data_path: &Path, public_url: Option<&str>) -> MarginConfig {
    let path = |name: &str| data_path.join(name).to_string_lossy().to_string();
    let mut config = MarginConfig::generate_default();
    config.margin.data_dir = data_path.to_string_lossy().to_string();
    config.margin.public_url = public_url.map(|u| u.trim_end_matches('/').to_string());
    config.margin.database.path = Some(path("margin.db"));
    config.margin.master_key_path = Some(path("margin.key"));
    config.margin.signing_key_path = Some(path("signing_key.pem"));
    config
}

/// Run the `init` command: create the data directory, keys, configuration
/// and database.
pub async fn run(data_dir: &str, public_url: Option<&str>) -> anyhow::Result<()> {
    let data_path = Path::new(data_dir);

    if !data_path.exists() {
        std::fs::create_dir_all(data_path)?;
        info!("Created data directory: {}", data_dir);
    }

    let config = initial_config(data_path, public_url);
    let config_path = data_path.join("margin.toml");
    if config_path.exists() {
        anyhow::bail!(
            "{} already exists; refusing to overwrite it and its keys",
            config_path.display()
        );
    }

    // Tenant secrets are encrypted under this key.
    let master_key_path = data_path.join("margin.key");
    std::fs::write(&master_key_path, hex::encode(crypto::generate_key()))?;
    info!(
        "Generated master encryption key: {}",
        master_key_path.display()
    );

    // Signs LTI Advantage client assertions; published at /lti/1.3/jwks.
    let signing_key_path = data_path.join("signing_key.pem");
    let pem = ToolKey::generate_pem()?;
    let kid = ToolKey::from_pem(&pem)?.kid().to_string();
    std::fs::write(&signing_key_path, &pem)?;
    info!(
        "Generated LTI signing key {}: {}",
        kid,
        signing_key_path.display()
    );

    let toml_str = toml::to_string_pretty(&config)?;
    std::fs::write(&config_path, &toml_str)?;
    info!("Wrote configuration to {}", config_path.display());

    let db_path = config.margin.database.path.clone().unwrap_or_default();
    DatabasePool::new_sqlite(&format!("sqlite:{}?mode=rwc", db_path)).await?;
    info!("Database initialized at {}", db_path);

    println!("margin initialized successfully!");
    println!("  Data directory: {}", data_dir);
    println!("  Configuration:  {}", config_path.display());
    println!("  Database:       {}", db_path);
    println!("  Master key:     {}", master_key_path.display());
    println!("  Signing key:    {} (kid {})", signing_key_path.display(), kid);
    println!();
    println!("Next steps:");
    println!(
        "  1. Edit {} to set the annotation service ([h]) credentials",
        config_path.display()
    );
    if public_url.is_none() {
        println!("  2. Set margin.public_url to the URL LMSes will launch");
    }
    println!(
        "  Run `margin --config {} serve` to start the service",
        config_path.display()
    );

    Ok(())
}
