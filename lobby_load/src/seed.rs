//! The `seed-users` credential resolver.
//!
//! Logs in as the admin once, then resolves every identity's email to its
//! user ID and appends an `email,userId` record per identity to the output
//! file. Identities that cannot be resolved are still written, with an empty
//! user ID, so the output always lines up with the input.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use lobby_signal::Watcher;
use metrics::counter;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{config, iam, identity};

const HEADER: [&str; 2] = ["email", "userId"];

fn default_pacing_millis() -> u64 {
    100
}

fn default_verify_user_login() -> bool {
    true
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Resolver`].
pub enum Error {
    /// Config lacks the `seed` section.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// IAM client could not be built.
    #[error(transparent)]
    Iam(#[from] iam::Error),
    /// Input identities could not be loaded.
    #[error(transparent)]
    Identity(#[from] identity::Error),
    /// The output file could not be created.
    #[error("Failed to create output file {path}: {source}")]
    Create {
        /// File path
        path: String,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A record could not be written to the output file.
    #[error("Failed to write output record: {0}")]
    Write(#[from] csv::Error),
    /// The output file could not be flushed.
    #[error("Failed to flush output file: {0}")]
    Flush(#[source] Box<io::Error>),
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the `seed-users` subcommand.
pub struct Config {
    /// CSV of identities to resolve, needs an `email` column
    pub input_path: PathBuf,
    /// Where the `email,userId` records are written, truncated first
    pub output_path: PathBuf,
    /// Pause between identities
    #[serde(default = "default_pacing_millis")]
    pub pacing_millis: u64,
    /// Also log in as each user and warn if that fails
    #[serde(default = "default_verify_user_login")]
    pub verify_user_login: bool,
}

impl Config {
    /// Pause between identities.
    #[must_use]
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_millis)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Counts of identities written by a [`Resolver`] run.
pub struct Summary {
    /// Written with a user ID
    pub resolved: usize,
    /// Written with an empty user ID
    pub unresolved: usize,
}

/// The `email,userId` output file.
struct Output {
    writer: csv::Writer<File>,
}

impl Output {
    fn create(path: &Path) -> Result<Self, Error> {
        let file = File::create(path).map_err(|source| Error::Create {
            path: path.display().to_string(),
            source: Box::new(source),
        })?;
        let mut output = Self {
            writer: csv::Writer::from_writer(file),
        };
        output.append(HEADER[0], HEADER[1])?;
        Ok(output)
    }

    fn append(&mut self, email: &str, user_id: &str) -> Result<(), Error> {
        self.writer.write_record([email, user_id])?;
        self.writer
            .flush()
            .map_err(|source| Error::Flush(Box::new(source)))
    }
}

#[derive(Debug)]
/// Resolves identities to user IDs.
pub struct Resolver {
    config: Config,
    iam: iam::Client,
    admin_email: String,
    admin_password: String,
    user_password: String,
    shutdown: Watcher,
}

impl Resolver {
    /// Create a new [`Resolver`].
    ///
    /// # Errors
    ///
    /// Function will error if the config has no `seed` section or the IAM
    /// client cannot be built.
    pub fn new(config: &config::Config, shutdown: Watcher) -> Result<Self, Error> {
        Ok(Self {
            config: config.seed()?.clone(),
            iam: config.iam_client()?,
            admin_email: config.admin_email.clone(),
            admin_password: config.admin_password.clone(),
            user_password: config.user_login_password.clone(),
            shutdown,
        })
    }

    /// Run the resolver to completion, or until shutdown is signalled.
    ///
    /// # Errors
    ///
    /// Function will error if the input cannot be read or the output cannot
    /// be written. IAM failures are logged and recorded as empty user IDs.
    pub async fn run(self) -> Result<Summary, Error> {
        let identities = identity::load(&self.config.input_path, &self.user_password)?;
        let mut output = Output::create(&self.config.output_path)?;
        let mut summary = Summary::default();

        info!(
            "Resolving {count} identities into {path}",
            count = identities.len(),
            path = self.config.output_path.display()
        );

        let admin_token = match self.iam.login(&self.admin_email, &self.admin_password).await {
            Ok(token) => Some(token),
            Err(err) => {
                error!("Admin login failed, no user IDs will be resolved: {err}");
                counter!("login_failure", "role" => "admin").increment(1);
                None
            }
        };

        let Some(admin_token) = admin_token else {
            for identity in &identities {
                output.append(&identity.email, "")?;
                summary.unresolved += 1;
            }
            return Ok(summary);
        };

        let pacing = self.config.pacing();
        for (index, identity) in identities.iter().enumerate() {
            if index > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            if self.shutdown.is_signalled() {
                warn!(
                    "Shutdown signalled, stopping after {done} of {total} identities",
                    done = index,
                    total = identities.len()
                );
                break;
            }

            if self.config.verify_user_login {
                self.verify_login(identity).await;
            }

            match self.iam.user_id_by_email(&admin_token, &identity.email).await {
                Ok(user_id) => {
                    counter!("lookup_ok").increment(1);
                    info!("{email} resolved to {user_id}", email = identity.email);
                    output.append(&identity.email, &user_id)?;
                    summary.resolved += 1;
                }
                Err(err) => {
                    counter!("lookup_failure").increment(1);
                    warn!("Lookup of {email} failed: {err}", email = identity.email);
                    output.append(&identity.email, "")?;
                    summary.unresolved += 1;
                }
            }
        }

        info!(
            "Resolved {resolved} identities, {unresolved} unresolved",
            resolved = summary.resolved,
            unresolved = summary.unresolved
        );
        Ok(summary)
    }

    async fn verify_login(&self, identity: &identity::Identity) {
        match self.iam.login(&identity.email, &identity.password).await {
            Ok(_) => {
                counter!("login_ok", "role" => "user").increment(1);
            }
            Err(err) => {
                counter!("login_failure", "role" => "user").increment(1);
                warn!("Login as {email} failed: {err}", email = identity.email);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::atomic::Ordering};

    use super::*;
    use crate::iam::tests::{ADMIN_EMAIL, CLIENT_ID, FakeIam, NAMESPACE, PASSWORD};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: config::Config,
        output_path: PathBuf,
    }

    fn fixture(iam: &FakeIam, admin_password: &str, emails: &[&str]) -> Fixture {
        let addr = iam.serve();
        let dir = tempfile::tempdir().expect("directory could not be created");
        let input_path = dir.path().join("users.csv");
        let output_path = dir.path().join("resolved.csv");

        let mut input = String::from("email\n");
        for email in emails {
            input.push_str(email);
            input.push('\n');
        }
        fs::write(&input_path, input).expect("write input");

        let yaml = format!(
            "
base_url: http://{addr}
ws_url: ws://{addr}/lobby
game_client_id: {CLIENT_ID}
game_namespace: {NAMESPACE}
admin_email: {ADMIN_EMAIL}
admin_password: {admin_password}
user_login_password: {PASSWORD}
seed:
  input_path: {input}
  output_path: {output}
  pacing_millis: 0
",
            input = input_path.display(),
            output = output_path.display(),
        );
        let config = config::parse(&yaml).expect("valid config");
        Fixture {
            _dir: dir,
            config,
            output_path,
        }
    }

    #[tokio::test]
    async fn unresolved_lookup_writes_empty_user_id() {
        let iam = FakeIam::with_users(&[("a@example.net", "id-a"), ("c@example.net", "id-c")]);
        let fixture = fixture(
            &iam,
            PASSWORD,
            &["a@example.net", "b@example.net", "c@example.net"],
        );
        let (watcher, _broadcaster) = lobby_signal::signal();

        let summary = Resolver::new(&fixture.config, watcher)
            .expect("resolver builds")
            .run()
            .await
            .expect("run succeeds");

        assert_eq!(
            summary,
            Summary {
                resolved: 2,
                unresolved: 1
            }
        );
        let output = fs::read_to_string(&fixture.output_path).expect("output exists");
        assert_eq!(
            output,
            "email,userId\na@example.net,id-a\nb@example.net,\nc@example.net,id-c\n"
        );
        // admin plus one verification login per identity
        assert_eq!(iam.logins.load(Ordering::SeqCst), 4);
        assert_eq!(iam.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn admin_login_failure_writes_every_row_without_lookups() {
        let iam = FakeIam::with_users(&[("a@example.net", "id-a")]);
        let fixture = fixture(&iam, "not-the-password", &["a@example.net", "b@example.net"]);
        let (watcher, _broadcaster) = lobby_signal::signal();

        let summary = Resolver::new(&fixture.config, watcher)
            .expect("resolver builds")
            .run()
            .await
            .expect("run succeeds");

        assert_eq!(
            summary,
            Summary {
                resolved: 0,
                unresolved: 2
            }
        );
        let output = fs::read_to_string(&fixture.output_path).expect("output exists");
        assert_eq!(output, "email,userId\na@example.net,\nb@example.net,\n");
        assert_eq!(iam.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn user_login_failure_does_not_change_output() {
        let iam = FakeIam {
            reject_logins: true,
            ..FakeIam::with_users(&[("a@example.net", "id-a")])
        };
        let fixture = fixture(&iam, PASSWORD, &["a@example.net"]);
        let (watcher, _broadcaster) = lobby_signal::signal();

        let summary = Resolver::new(&fixture.config, watcher)
            .expect("resolver builds")
            .run()
            .await
            .expect("run succeeds");

        // every login is rejected, the admin one included
        assert_eq!(summary.unresolved, 1);
        assert_eq!(
            fs::read_to_string(&fixture.output_path).expect("output exists"),
            "email,userId\na@example.net,\n"
        );
    }

    #[tokio::test]
    async fn existing_output_is_truncated() {
        let iam = FakeIam::with_users(&[("a@example.net", "id-a")]);
        let fixture = fixture(&iam, PASSWORD, &["a@example.net"]);
        fs::write(&fixture.output_path, "stale,row\nmore,stale\nrows,here\n").expect("seed output");
        let (watcher, _broadcaster) = lobby_signal::signal();

        Resolver::new(&fixture.config, watcher)
            .expect("resolver builds")
            .run()
            .await
            .expect("run succeeds");

        assert_eq!(
            fs::read_to_string(&fixture.output_path).expect("output exists"),
            "email,userId\na@example.net,id-a\n"
        );
    }

    #[tokio::test]
    async fn shutdown_stops_before_next_identity() {
        let iam = FakeIam::with_users(&[("a@example.net", "id-a")]);
        let fixture = fixture(&iam, PASSWORD, &["a@example.net", "b@example.net"]);
        let (watcher, broadcaster) = lobby_signal::signal();
        broadcaster.signal();

        let summary = Resolver::new(&fixture.config, watcher)
            .expect("resolver builds")
            .run()
            .await
            .expect("run succeeds");

        assert_eq!(summary, Summary::default());
        assert_eq!(
            fs::read_to_string(&fixture.output_path).expect("output exists"),
            "email,userId\n"
        );
        assert_eq!(iam.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_seed_section_is_an_error() {
        let config = config::parse(
            "
base_url: http://127.0.0.1:1
ws_url: ws://127.0.0.1:1
game_client_id: a
game_namespace: b
admin_email: c
admin_password: d
user_login_password: e
",
        )
        .expect("valid config");
        let (watcher, _broadcaster) = lobby_signal::signal();
        assert!(matches!(
            Resolver::new(&config, watcher),
            Err(Error::Config(config::Error::MissingSection("seed")))
        ));
    }
}
