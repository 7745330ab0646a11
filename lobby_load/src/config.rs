//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{iam, seed, session};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The subcommand needs a section the config does not have.
    #[error("Config has no `{0}` section")]
    MissingSection(&'static str),
    /// The session ramp has no stages.
    #[error("session.stages must not be empty")]
    NoStages,
    /// A zero keep-alive period would spin.
    #[error("session.keep_alive_seconds must be greater than zero")]
    ZeroKeepAlive,
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// IAM base URL, e.g. `https://iam.example.net/iam`
    pub base_url: String,
    /// Lobby WebSocket URL
    pub ws_url: String,
    /// OAuth client ID of the game client
    pub game_client_id: String,
    /// Game namespace used for admin lookups
    pub game_namespace: String,
    /// Admin login name used by `seed-users`
    pub admin_email: String,
    /// Admin password used by `seed-users`
    pub admin_password: String,
    /// Password shared by every test user
    pub user_login_password: String,
    /// The method by which to express telemetry
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub telemetry: Option<Telemetry>,
    /// Settings for `run`
    #[serde(default)]
    pub session: Option<session::Config>,
    /// Settings for `seed-users`
    #[serde(default)]
    pub seed: Option<seed::Config>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Defines the manner of telemetry export.
pub enum Telemetry {
    /// Expose internal telemetry for scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Build the IAM client every subcommand talks through.
    ///
    /// # Errors
    ///
    /// Function will error if the HTTP client cannot be constructed.
    pub fn iam_client(&self) -> Result<iam::Client, iam::Error> {
        iam::Client::new(&self.base_url, &self.game_client_id, &self.game_namespace)
    }

    /// The `session` section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSection`] if the config has no such section.
    pub fn session(&self) -> Result<&session::Config, Error> {
        self.session.as_ref().ok_or(Error::MissingSection("session"))
    }

    /// The `seed` section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSection`] if the config has no such section.
    pub fn seed(&self) -> Result<&seed::Config, Error> {
        self.seed.as_ref().ok_or(Error::MissingSection("seed"))
    }

    fn validate(&self) -> Result<(), Error> {
        if let Some(session) = &self.session {
            if session.stages.is_empty() {
                return Err(Error::NoStages);
            }
            if session.keep_alive_seconds == 0 {
                return Err(Error::ZeroKeepAlive);
            }
        }
        Ok(())
    }
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Function will error if the YAML is malformed, has unknown keys or fails
/// validation.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a YAML file.
///
/// # Errors
///
/// Function will error if the file cannot be read or [`parse`] fails.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use super::*;
    use crate::{ramp::Stage, session::reconnect};

    const BASE: &str = r"
base_url: https://iam.example.net/iam
ws_url: wss://lobby.example.net/lobby/
game_client_id: abc
game_namespace: mygame
admin_email: admin@example.net
admin_password: secret
user_login_password: hunter2
";

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let contents = format!(
            "{BASE}
telemetry:
  prometheus:
    addr: 0.0.0.0:9000
    global_labels:
      run: nightly
session:
  users_path: users.csv
  stages:
    - duration_seconds: 120
      target: 30
    - duration_seconds: 120
      target: 10
  keep_alive_seconds: 5
  reconnect:
    max_attempts: 1
seed:
  input_path: users_1K.csv
  output_path: new_users_1K.csv
"
        );
        let config = parse(&contents)?;

        assert_eq!(config.game_namespace, "mygame");
        let mut labels = FxHashMap::default();
        labels.insert("run".to_string(), "nightly".to_string());
        assert_eq!(
            config.telemetry,
            Some(Telemetry::Prometheus {
                addr: "0.0.0.0:9000".parse().expect("valid address"),
                global_labels: labels,
            })
        );

        let session = config.session()?;
        assert_eq!(session.users_path, PathBuf::from("users.csv"));
        assert_eq!(session.start_vus, 0);
        assert_eq!(
            session.stages,
            vec![
                Stage {
                    duration_seconds: 120,
                    target: 30
                },
                Stage {
                    duration_seconds: 120,
                    target: 10
                },
            ]
        );
        assert_eq!(session.keep_alive(), Duration::from_secs(5));
        assert_eq!(session.shutdown_buffer(), Duration::from_secs(3));
        assert_eq!(session.close_timeout(), Duration::from_secs(3));
        assert_eq!(session.graceful_stop(), Duration::from_secs(10));
        assert_eq!(session.graceful_ramp_down(), Duration::from_secs(30));
        assert_eq!(
            session.reconnect,
            reconnect::Policy {
                max_attempts: 1,
                ..reconnect::Policy::default()
            }
        );

        let seed = config.seed()?;
        assert_eq!(seed.input_path, PathBuf::from("users_1K.csv"));
        assert_eq!(seed.pacing(), Duration::from_millis(100));
        assert!(seed.verify_user_login);
        Ok(())
    }

    #[test]
    fn telemetry_is_keyed_by_exporter() -> Result<(), Error> {
        let contents = format!("{BASE}\ntelemetry:\n  prometheus:\n    addr: 127.0.0.1:9090\n");
        let config = parse(&contents)?;
        assert_eq!(
            config.telemetry,
            Some(Telemetry::Prometheus {
                addr: "127.0.0.1:9090".parse().expect("valid address"),
                global_labels: FxHashMap::default(),
            })
        );
        Ok(())
    }

    #[test]
    fn unknown_exporter_rejected() {
        let contents = format!("{BASE}\ntelemetry:\n  statsd:\n    addr: 127.0.0.1:9090\n");
        assert!(matches!(parse(&contents), Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn sections_are_optional_until_needed() -> Result<(), Error> {
        let config = parse(BASE)?;
        assert!(config.telemetry.is_none());
        assert!(matches!(config.session(), Err(Error::MissingSection("session"))));
        assert!(matches!(config.seed(), Err(Error::MissingSection("seed"))));
        Ok(())
    }

    #[test]
    fn unknown_keys_rejected() {
        let contents = format!("{BASE}\nvus: 30\n");
        assert!(matches!(parse(&contents), Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn missing_required_key_rejected() {
        assert!(matches!(
            parse("base_url: https://iam.example.net/iam\n"),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn empty_stages_rejected() {
        let contents = format!("{BASE}\nsession:\n  users_path: users.csv\n  stages: []\n");
        assert!(matches!(parse(&contents), Err(Error::NoStages)));
    }

    #[test]
    fn zero_keep_alive_rejected() {
        let contents = format!(
            "{BASE}\nsession:\n  users_path: users.csv\n  keep_alive_seconds: 0\n  stages:\n    - duration_seconds: 1\n      target: 1\n"
        );
        assert!(matches!(parse(&contents), Err(Error::ZeroKeepAlive)));
    }

    #[test]
    fn load_single_file_works() -> Result<(), Box<dyn std::error::Error>> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("lobby-load.yaml");
        let mut file = fs::File::create(&config_path)?;
        file.write_all(BASE.as_bytes())?;

        let config = load_config_from_path(&config_path)?;
        assert_eq!(config.game_client_id, "abc");
        Ok(())
    }

    #[test]
    fn load_reports_missing_file() {
        let result = load_config_from_path(Path::new("/nonexistent/lobby-load.yaml"));
        assert!(matches!(result, Err(Error::ReadFile { .. })));
    }
}
