use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::{Path, PathBuf};

/// Write a starter config to the user config directory, or print it with `stdout`
pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let config_path = default_config_path();
    write_config(&config_path, &config_content)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// ~/.config/kandi/config.yml when a home directory exists and can be created,
/// else /etc/kandi/config.yml
fn default_config_path() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/kandi/config.yml");
        if let Some(parent) = user_config.parent() {
            match fs::create_dir_all(parent) {
                Ok(()) => return user_config,
                Err(e) => {
                    eprintln!("Warning: Could not create directory {}: {}", parent.display(), e);
                    eprintln!("Falling back to /etc/kandi/config.yml");
                }
            }
        }
    }
    PathBuf::from("/etc/kandi/config.yml")
}

/// Refuses to overwrite an existing file
pub fn write_config(path: &Path, config_content: &str) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            path.display()
        )
        .into());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)?;
    Ok(())
}
