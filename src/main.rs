use reportdesk::app;
use reportdesk::config::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env()?;
    log::info!(
        "starting reportdesk (data: {}, uploads: {})",
        settings
            .data_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "in memory".to_string()),
        settings.upload_dir.display()
    );

    app::run(settings).await?;
    Ok(())
}
