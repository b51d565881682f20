use anyhow::Result;
use hical_app::{AppServices, PlatformPorts};

#[tokio::main]
async fn main() -> Result<()> {
    hical_core::init()?;

    let (config, _validation) = hical_core::Config::load_validated()?;
    let platform = PlatformPorts::for_config(&config, false);
    let services = AppServices::build(config, platform)?;
    services.spawn_background_tasks();

    tracing::info!("HiCal started");

    let stats = services.cloud().stats()?;
    println!("HiCal - calendar core");
    println!(
        "  Data directory:  {}",
        services.config().storage.data_dir.display()
    );
    println!("  Events stored:   {}", stats.local_event_count);
    println!("  Pending changes: {}", services.store().dirty_count()?);
    println!(
        "  Last cloud sync: {}",
        stats
            .last_sync_time
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
    );

    services.shutdown().await;
    Ok(())
}
