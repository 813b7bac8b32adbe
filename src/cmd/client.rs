use color_eyre::eyre::{Result, WrapErr, eyre};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Failure body returned by the registrar API
#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Thin JSON client for the registrar HTTP API
pub struct ApiClient {
    base: String,
    http: Client,
}

impl ApiClient {
    pub fn new(server: &str) -> Self {
        Self {
            base: server.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .wrap_err_with(|| format!("failed to reach {}", self.base))?;
        Self::decode(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!(path, "POST");
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .wrap_err_with(|| format!("failed to reach {}", self.base))?;
        Self::decode(response).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "DELETE");
        let response = self
            .http
            .delete(self.url(path))
            .send()
            .await
            .wrap_err_with(|| format!("failed to reach {}", self.base))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .wrap_err("failed to read the response body")?;
        // Some failures (405 from the HTTP layer) carry no body at all.
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        if status.is_success() {
            return serde_json::from_value(body).wrap_err("unexpected response shape");
        }
        Err(api_error(status, body))
    }
}

fn api_error(status: StatusCode, body: Value) -> color_eyre::eyre::Report {
    match serde_json::from_value::<Status>(body) {
        Ok(failure) if !failure.message.is_empty() => {
            eyre!("{} ({}): {}", status, failure.reason, failure.message)
        }
        _ => eyre!("request failed with {}", status),
    }
}

/// Path of a resource collection, namespaced when `namespace` is given
pub fn collection_path(group: &str, version: &str, resource: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("/apis/{}/{}/namespaces/{}/{}", group, version, ns, resource),
        None => format!("/apis/{}/{}/{}", group, version, resource),
    }
}
