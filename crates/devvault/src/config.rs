//! Declared configuration
//!
//! A flat `KEY="value"` file that records which mode the store should run
//! in, whether it may be unsealed automatically, and how to launch it.
//! The file is shell-sourceable so a startup wrapper can read it too.
//!
//! ```text
//! MODE="durable"
//! AUTO_UNSEAL="false"
//! LAUNCH_COMMAND="vault server -config=/home/me/.local/share/devvault/durable/server.hcl"
//! ```

use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::mode::Mode;
use crate::settings::Settings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("unknown mode '{0}' (expected ephemeral or durable)")]
    InvalidMode(String),

    #[error("{key} must be true or false, got '{value}'")]
    InvalidBool { key: String, value: String },

    #[error("invalid store address: {0}")]
    Address(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The single active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub mode: Mode,
    pub auto_unseal: bool,
    pub launch_command: String,
}

impl Configuration {
    /// Configuration for `mode` with its standard launch command
    pub fn for_mode(mode: Mode, auto_unseal: bool, settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            mode,
            auto_unseal,
            launch_command: launch_command(mode, settings)?,
        })
    }

    /// Fresh installs run ephemeral and never auto-unseal
    pub fn default_for(settings: &Settings) -> Result<Self, ConfigError> {
        Self::for_mode(Mode::Ephemeral, false, settings)
    }

    /// Serialize to the flat file format
    pub fn render(&self) -> String {
        format!(
            "# devvault declared configuration\nMODE={}\nAUTO_UNSEAL={}\nLAUNCH_COMMAND={}\n",
            quote(self.mode.as_str()),
            quote(if self.auto_unseal { "true" } else { "false" }),
            quote(&self.launch_command),
        )
    }

    /// Parse the flat file format; keys missing from the file take defaults
    pub fn parse(text: &str, settings: &Settings) -> Result<Self, ConfigError> {
        let mut mode = None;
        let mut auto_unseal = false;
        let mut launch = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse {
                    line: line_no,
                    reason: format!("expected KEY=\"value\", got '{}'", line),
                });
            };
            let key = key.trim();
            let value = unquote(value.trim()).map_err(|reason| ConfigError::Parse {
                line: line_no,
                reason,
            })?;

            match key {
                "MODE" => {
                    mode = Some(
                        Mode::from_str(&value).ok_or_else(|| ConfigError::InvalidMode(value.clone()))?,
                    )
                }
                "AUTO_UNSEAL" => auto_unseal = parse_bool(key, &value)?,
                "LAUNCH_COMMAND" => launch = Some(value),
                other => debug!("ignoring unknown configuration key {}", other),
            }
        }

        let mode = mode.unwrap_or_default();
        let launch_command = match launch {
            Some(cmd) if !cmd.trim().is_empty() => cmd,
            _ => launch_command(mode, settings)?,
        };

        Ok(Self {
            mode,
            auto_unseal,
            launch_command,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn unquote(value: &str) -> Result<String, String> {
    let Some(inner) = value.strip_prefix('"') else {
        return Ok(value.to_string());
    };
    let Some(inner) = inner.strip_suffix('"') else {
        return Err("unterminated quote".to_string());
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => return Err("dangling escape".to_string()),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Command line that launches the store in `mode`
pub fn launch_command(mode: Mode, settings: &Settings) -> Result<String, ConfigError> {
    match mode {
        Mode::Ephemeral => {
            let listen = settings
                .listen_address()
                .map_err(|e| ConfigError::Address(e.to_string()))?;
            Ok(format!(
                "{} server -dev -dev-root-token-id={} -dev-listen-address={}",
                settings.store_bin, settings.dev_token, listen
            ))
        }
        Mode::Durable => Ok(format!(
            "{} server -config={}",
            settings.store_bin,
            settings.paths.durable_server_config().display()
        )),
    }
}

/// Server configuration for durable mode: raft storage under the data dir
pub fn durable_server_hcl(settings: &Settings) -> Result<String, ConfigError> {
    let listen = settings
        .listen_address()
        .map_err(|e| ConfigError::Address(e.to_string()))?;
    let cluster = match listen.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().unwrap_or(8200);
            format!("http://{}:{}", host, port.saturating_add(1))
        }
        None => format!("http://{}", listen),
    };

    Ok(format!(
        r#"storage "raft" {{
  path    = "{storage}"
  node_id = "devvault-node"
}}

listener "tcp" {{
  address     = "{listen}"
  tls_disable = true
}}

api_addr      = "{api}"
cluster_addr  = "{cluster}"
disable_mlock = true
ui            = true
"#,
        storage = settings.paths.durable_storage().display(),
        listen = listen,
        api = settings.addr,
        cluster = cluster,
    ))
}

/// Accessor for the configuration file; the only code that touches it
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the declared configuration, or defaults when none was written yet
    pub fn load(&self, settings: &Settings) -> Result<Configuration, ConfigError> {
        if !self.path.exists() {
            return Configuration::default_for(settings);
        }
        let text = fs::read_to_string(&self.path).map_err(io_err(&self.path))?;
        Configuration::parse(&text, settings)
    }

    /// Replace the file atomically and restrict it to the owner
    pub fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        let dir = self.parent();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let tmp = self.tmp_path();
        fs::write(&tmp, config.render()).map_err(io_err(&tmp))?;
        fs::set_permissions(&tmp, Permissions::from_mode(0o600)).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;

        debug!("configuration written: mode={}", config.mode);
        Ok(())
    }

    /// Prove a later `save` can succeed without changing anything
    pub fn check_writable(&self) -> Result<(), ConfigError> {
        let dir = self.parent();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let tmp = self.tmp_path();
        fs::write(&tmp, b"").map_err(io_err(&tmp))?;
        fs::remove_file(&tmp).map_err(io_err(&tmp))?;

        if self.path.exists() {
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map_err(io_err(&self.path))?;
        }
        Ok(())
    }

    fn parent(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        self.parent().join(format!(".{}.tmp", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devvault_core::Paths;
    use tempfile::tempdir;

    fn settings(root: &Path) -> Settings {
        let paths = Paths::with_dirs(&root.join("data"), &root.join("config"));
        Settings::new("http://127.0.0.1:8200", paths).unwrap()
    }

    #[test]
    fn test_missing_file_defaults_to_sealed_ephemeral() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let store = ConfigStore::new(&settings.paths.config_file());

        let config = store.load(&settings).unwrap();
        assert_eq!(config.mode, Mode::Ephemeral);
        assert!(!config.auto_unseal);
        assert!(config.launch_command.contains("-dev-root-token-id=root"));
        assert!(config.launch_command.contains("-dev-listen-address=127.0.0.1:8200"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let store = ConfigStore::new(&settings.paths.config_file());

        let config = Configuration::for_mode(Mode::Durable, true, &settings).unwrap();
        store.save(&config).unwrap();

        assert_eq!(store.load(&settings).unwrap(), config);
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_parse_quotes_comments_and_export() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let text = "# comment\n\nexport MODE=raft\nAUTO_UNSEAL=\"yes\"\nLAUNCH_COMMAND=\"vault server -config=\\\"/x y/s.hcl\\\"\"\nEXTRA=1\n";

        let config = Configuration::parse(text, &settings).unwrap();
        assert_eq!(config.mode, Mode::Durable);
        assert!(config.auto_unseal);
        assert_eq!(config.launch_command, "vault server -config=\"/x y/s.hcl\"");
    }

    #[test]
    fn test_render_escapes_round_trip() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let config = Configuration {
            mode: Mode::Durable,
            auto_unseal: false,
            launch_command: r#"sh -c "echo \"hi\"""#.to_string(),
        };
        assert_eq!(Configuration::parse(&config.render(), &settings).unwrap(), config);
    }

    #[test]
    fn test_parse_errors() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());

        assert!(matches!(
            Configuration::parse("MODE=\"sqlite\"", &settings),
            Err(ConfigError::InvalidMode(_))
        ));
        assert!(matches!(
            Configuration::parse("AUTO_UNSEAL=\"sometimes\"", &settings),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            Configuration::parse("MODE=\"durable\"\nnonsense", &settings),
            Err(ConfigError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            Configuration::parse("MODE=\"durable", &settings),
            Err(ConfigError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_durable_launch_and_hcl() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());

        let launch = launch_command(Mode::Durable, &settings).unwrap();
        assert!(launch.ends_with("durable/server.hcl"));

        let hcl = durable_server_hcl(&settings).unwrap();
        assert!(hcl.contains("storage \"raft\""));
        assert!(hcl.contains(&settings.paths.durable_storage().display().to_string()));
        assert!(hcl.contains("address     = \"127.0.0.1:8200\""));
        assert!(hcl.contains("cluster_addr  = \"http://127.0.0.1:8201\""));
    }

    #[test]
    fn test_check_writable_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let store = ConfigStore::new(&settings.paths.config_file());

        store.check_writable().unwrap();
        assert!(!store.exists());
        let leftovers: Vec<_> = fs::read_dir(&settings.paths.config).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_check_writable_fails_on_read_only_dir() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let store = ConfigStore::new(&settings.paths.config_file());
        store.save(&Configuration::default_for(&settings).unwrap()).unwrap();

        fs::set_permissions(&settings.paths.config, Permissions::from_mode(0o500)).unwrap();
        // Privileged users bypass directory permissions; nothing to assert then
        let privileged = fs::write(settings.paths.config.join("write-check"), b"").is_ok();
        let result = store.check_writable();
        fs::set_permissions(&settings.paths.config, Permissions::from_mode(0o700)).unwrap();

        if !privileged {
            assert!(matches!(result, Err(ConfigError::Io { .. })));
        }
    }
}
