//! `tidewire stop`: Stop the backend's running generation.

use tidewire_core::Backend;

use super::{connect, load_config};

pub async fn run() -> anyhow::Result<()> {
    let config = load_config()?;
    let backend = connect(&config)?;
    backend.stop_generation().await?;
    println!("  Stop requested.");
    Ok(())
}
