//! `pingwatch config`: print the effective configuration, optionally
//! writing a default file first.

use std::path::Path;

use anyhow::Context;
use pingwatch_core::MonitorConfig;

pub fn cmd_config(path: &Path, init: bool) -> anyhow::Result<()> {
    if init {
        if path.exists() {
            eprintln!("config already exists at {}", path.display());
        } else {
            write_default(path)?;
            eprintln!("default config written to {}", path.display());
        }
    }

    let (config, issues) = MonitorConfig::load(path);
    for issue in &issues {
        eprintln!("warning: {issue}");
    }
    println!("# {}", path.display());
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn write_default(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let text = MonitorConfig::default().to_toml_string()?;
    std::fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}
