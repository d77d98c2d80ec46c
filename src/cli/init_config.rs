use session_relay::config::{default_database_path, RelayConfig};
use std::path::Path;

/// Write the default configuration to `path`.
///
/// An existing file is left alone unless `force` is set.
pub fn execute(path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        println!("Config already exists: {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    RelayConfig::create_default(path, &default_database_path())?;
    println!("📝 Created config: {}", path.display());
    Ok(())
}
