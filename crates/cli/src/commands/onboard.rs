//! `coachflow onboard`: write a starter config file.

use coachflow_config::AppConfig;
use std::path::Path;

pub async fn run(path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(AppConfig::config_path);

    println!("Coachflow setup");
    println!("===============\n");

    if write_default(&config_path, force)? {
        println!("Created config at: {}", config_path.display());
        println!("\nNext steps:");
        println!("  1. Add [[sequences]] and [[rules]] to {}", config_path.display());
        println!("  2. Point [sender] at your email/DM provider (or keep kind = \"log\")");
        println!("  3. Run: coachflow daemon\n");
    } else {
        println!("Config already exists at: {}", config_path.display());
        println!("  Edit it manually or re-run with --force.\n");
    }

    Ok(())
}

/// Write the default config to `path`. Returns `false` if a file was already
/// there and `force` is off.
fn write_default(path: &Path, force: bool) -> std::io::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert!(write_default(&path, false).unwrap());
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.store.backend, AppConfig::default().store.backend);

        std::fs::write(&path, "# edited\n").unwrap();
        assert!(!write_default(&path, false).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# edited\n");

        assert!(write_default(&path, true).unwrap());
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "# edited\n");
    }
}
