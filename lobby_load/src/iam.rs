//! IAM client.
//!
//! Two calls against the identity service: the OAuth password grant used by
//! every user and by the admin, and the admin lookup of a user by email.

use reqwest::StatusCode;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Client`].
pub enum Error {
    /// The request could not be sent or its body could not be read.
    #[error("IAM request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// IAM answered with something other than 200.
    #[error("IAM returned {status}: {body}")]
    Status {
        /// Response status
        status: StatusCode,
        /// Response body, for the log
        body: String,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    user_id: String,
}

#[derive(Debug, Clone)]
/// A client for one IAM deployment and game namespace.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    namespace: String,
}

impl Client {
    /// Create a new [`Client`].
    ///
    /// # Errors
    ///
    /// Function will error if the underlying HTTP client cannot be built,
    /// usually a TLS backend problem.
    pub fn new(base_url: &str, client_id: &str, namespace: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Log in with the password grant, returning the access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] for any non-200 answer, [`Error::Request`]
    /// if IAM could not be reached or the body lacks `access_token`.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, Error> {
        let response = self
            .http
            .post(format!("{base}/oauth/token", base = self.base_url))
            .basic_auth(&self.client_id, None::<&str>)
            .form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
            ])
            .send()
            .await?;

        let response = ok_or_status(response).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    /// Look up a user ID by email address with an admin token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] for any non-200 answer, [`Error::Request`]
    /// if IAM could not be reached or the body lacks `userId`.
    pub async fn user_id_by_email(&self, admin_token: &str, email: &str) -> Result<String, Error> {
        let response = self
            .http
            .get(format!(
                "{base}/v3/admin/namespaces/{namespace}/users",
                base = self.base_url,
                namespace = self.namespace
            ))
            .bearer_auth(admin_token)
            .query(&[("emailAddress", email)])
            .send()
            .await?;

        let response = ok_or_status(response).await?;
        let user: UserResponse = response.json().await?;
        Ok(user.user_id)
    }
}

async fn ok_or_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status { status, body })
}
