//! Config command implementation.

use anyhow::{Context, Result};

use wisp_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = Config::load().context("Failed to load configuration")?;
            print!("{}", render(&config)?);
        }
        ConfigAction::Path => println!("{}", Config::config_path().display()),
        ConfigAction::Reset => {
            Config::default()
                .save()
                .context("Failed to write configuration")?;
            println!(
                "Configuration reset to defaults at {}",
                Config::config_path().display()
            );
        }
    }
    Ok(())
}

fn render(config: &Config) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_sections() {
        let rendered = render(&Config::default()).expect("render");
        for section in ["[general]", "[network]", "[transfer]", "[security]"] {
            assert!(rendered.contains(section), "missing {section}");
        }
        assert!(rendered.contains("open_timeout = \"5s\""));
    }
}
