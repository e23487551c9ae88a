//! HTTP client for the CA control API.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Body of `POST /v1/certificate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Service to issue a certificate for.
    pub service_name: String,
}

/// Successful response of `POST /v1/certificate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollResponse {
    /// Name the certificate was issued for.
    pub issued: String,
}

/// Response of `GET /v1/ca/cert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCaResponse {
    /// PEM-encoded root certificate.
    pub root_ca: String,
}

/// Response of `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Human-readable status line.
    pub status: String,
}

/// Error body returned for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: String,
    /// Human-readable detail.
    pub message: String,
}

/// Client for a remote CA.
#[derive(Debug, Clone)]
pub struct CaClient {
    base: Url,
    http: Client,
}

impl CaClient {
    /// Client for the CA at `base_url`, e.g. `http://127.0.0.1:9000`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid CA URL '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid CA URL '{base_url}'")));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base, http })
    }

    /// Base URL of the CA.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Ask the CA to issue (or reissue) a certificate for `service_name`.
    pub async fn enroll(&self, service_name: &str) -> Result<EnrollResponse> {
        let url = self.endpoint("v1/certificate")?;
        debug!(url = %url, service = %service_name, "Requesting certificate");
        let response = self
            .http
            .post(url)
            .json(&EnrollRequest {
                service_name: service_name.to_owned(),
            })
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Fetch the PEM-encoded root certificate.
    pub async fn root_ca(&self) -> Result<String> {
        let response = self.http.get(self.endpoint("v1/ca/cert")?).send().await?;
        let body: RootCaResponse = Self::decode(response).await?;
        Ok(body.root_ca)
    }

    /// Fetch the health status line.
    pub async fn health(&self) -> Result<String> {
        let response = self.http.get(self.endpoint("")?).send().await?;
        let body: HealthResponse = Self::decode(response).await?;
        Ok(body.status)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let mut base = self.base.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint '{path}': {e}")))
    }

    /// Decode a JSON body, turning non-2xx responses into errors that carry
    /// the server's message.
    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.message)
            .unwrap_or(text);
        Err(match status.as_u16() {
            400 => Error::InvalidServiceName(message),
            503 => Error::CaNotInitialized,
            _ => Error::Issuance(format!("CA responded {status}: {message}")),
        })
    }
}
