//! `fleetmap config` - inspect and edit `config.ini`.
//!
//! Every command reads the file fresh. A missing file means defaults; a
//! malformed one is an error.

use clap::Subcommand;
use fleetmap::config::{config_file_path, ConfigFile, ConfigKey};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print settings, optionally limited to one section
    Show {
        /// Section name (e.g., sync, queue, logging)
        section: Option<String>,
    },

    /// Print the value of one or more keys
    Get {
        /// Keys as section.key (e.g., sync.base_url)
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Change a setting and save the file
    Set {
        /// Key as section.key
        key: String,

        /// New value
        value: String,
    },

    /// Put a setting back to its default
    Reset {
        /// Key as section.key
        key: String,
    },

    /// Print where the configuration file lives
    Path,

    /// Create the configuration file with default settings
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show { section } => {
            let config = ConfigFile::load()?;
            print!("{}", render_settings(&config, section.as_deref())?);
        }
        ConfigCommands::Get { keys } => {
            let keys = keys
                .iter()
                .map(String::as_str)
                .map(lookup)
                .collect::<Result<Vec<_>, _>>()?;
            let config = ConfigFile::load()?;
            // A lone key prints its bare value so scripts can capture it.
            if let [key] = keys.as_slice() {
                println!("{}", key.get(&config));
            } else {
                for key in keys {
                    println!("{key}={}", key.get(&config));
                }
            }
        }
        ConfigCommands::Set { key, value } => {
            let key = lookup(&key)?;
            update(key, &value)?;
        }
        ConfigCommands::Reset { key } => {
            let key = lookup(&key)?;
            let default = key.get(&ConfigFile::default());
            update(key, &default)?;
        }
        ConfigCommands::Path => println!("{}", config_file_path().display()),
        ConfigCommands::Init { force } => {
            let path = config_file_path();
            if path.exists() && !force {
                return Err(CliError::Config(format!(
                    "{} exists; pass --force to replace it",
                    path.display()
                )));
            }
            ConfigFile::default().save_to(&path)?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}

fn lookup(name: &str) -> Result<ConfigKey, CliError> {
    name.parse().map_err(|_| {
        let known: Vec<String> = ConfigKey::all().map(|k| k.name()).collect();
        CliError::Config(format!(
            "no setting named '{}' (known: {})",
            name,
            known.join(", ")
        ))
    })
}

fn update(key: ConfigKey, value: &str) -> Result<(), CliError> {
    let mut config = ConfigFile::load()?;
    let before = key.get(&config);
    key.set(&mut config, value)?;
    config.save()?;
    println!("{key}: {} -> {}", shown(&before), shown(&key.get(&config)));
    Ok(())
}

fn shown(value: &str) -> &str {
    if value.is_empty() {
        "<empty>"
    } else {
        value
    }
}

/// One `section.key = value` line per setting, values aligned, non-default
/// values marked with `*`.
fn render_settings(config: &ConfigFile, section: Option<&str>) -> Result<String, CliError> {
    let defaults = ConfigFile::default();
    let keys: Vec<ConfigKey> = ConfigKey::all()
        .filter(|k| section.map_or(true, |s| k.section() == s))
        .collect();
    if keys.is_empty() {
        return Err(CliError::Config(format!(
            "no section named '{}'",
            section.unwrap_or_default()
        )));
    }

    let width = keys.iter().map(|k| k.name().len()).max().unwrap_or(0);
    let mut out = String::new();
    for key in keys {
        let value = key.get(config);
        let marker = if value == key.get(&defaults) { ' ' } else { '*' };
        out.push_str(&format!("{marker} {:<width$} = {}\n", key.name(), shown(&value)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_marks_changed_values() {
        let mut config = ConfigFile::default();
        let key: ConfigKey = "sync.base_url".parse().unwrap();
        key.set(&mut config, "https://fleet.example.com").unwrap();

        let rendered = render_settings(&config, Some("sync")).unwrap();
        let line = rendered
            .lines()
            .find(|l| l.contains("sync.base_url"))
            .unwrap();
        assert!(line.starts_with('*'));
        assert!(line.ends_with("= https://fleet.example.com"));
        assert!(rendered.lines().all(|l| l.contains("sync.")));
    }

    #[test]
    fn test_render_defaults_are_unmarked() {
        let rendered = render_settings(&ConfigFile::default(), None).unwrap();
        assert_eq!(rendered.lines().count(), ConfigKey::all().count());
        assert!(rendered.lines().all(|l| l.starts_with(' ')));
    }

    #[test]
    fn test_unknown_section_and_key_rejected() {
        assert!(render_settings(&ConfigFile::default(), Some("nope")).is_err());
        let err = lookup("sync.nope").unwrap_err().to_string();
        assert!(err.contains("sync.nope"));
        assert!(err.contains("sync.base_url"));
    }
}
