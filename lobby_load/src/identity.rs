//! Test user identities.
//!
//! Identities come from a CSV file with an `email` header column, one user
//! per row. Every user shares the password from configuration.

use std::{fs::File, io, path::Path};

use serde::Deserialize;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
/// Errors produced while loading identities.
pub enum Error {
    /// The identity file could not be opened.
    #[error("Failed to open identity file {path}: {source}")]
    Open {
        /// File path
        path: String,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A row could not be parsed.
    #[error("Failed to parse identity CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct Row {
    email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A user the load test logs in as.
pub struct Identity {
    /// Login name
    pub email: String,
    /// Login password
    pub password: String,
}

/// Load every identity in the CSV file at `path`.
///
/// # Errors
///
/// Function will error if the file cannot be opened or a row is malformed.
pub fn load(path: &Path, password: &str) -> Result<Vec<Identity>, Error> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source: Box::new(source),
    })?;
    let identities = from_reader(file, password)?;
    debug!(
        "Loaded {count} identities from {path}",
        count = identities.len(),
        path = path.display()
    );
    Ok(identities)
}

/// Read identities from any CSV source. Rows with a blank email are skipped.
///
/// # Errors
///
/// Function will error if a row is malformed or the `email` column is
/// missing.
pub fn from_reader<R: io::Read>(reader: R, password: &str) -> Result<Vec<Identity>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut identities = Vec::new();
    for (index, row) in reader.deserialize::<Row>().enumerate() {
        let row = row?;
        if row.email.is_empty() {
            warn!("Skipping identity row {row} with a blank email", row = index + 1);
            continue;
        }
        identities.push(Identity {
            email: row.email,
            password: password.to_string(),
        });
    }
    Ok(identities)
}
