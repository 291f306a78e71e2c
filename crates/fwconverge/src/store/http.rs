//! HTTP/JSON client for the security management server.
//!
//! Sessions are cookie based: [`SmcClient::login`] posts the API key, every
//! later request carries the session cookie, [`SmcClient::logout`] ends it.
//! Elements live under `{base}/elements/{entry_point}`; nested objects under
//! `{parent_href}/{kind}`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Attributes, MatchOptions, ObjectStore, Reference, RemoteObject, Result, StoreError};
use crate::config::ClientConfig;
use crate::registry::Registry;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY_LENGTH: usize = 300;

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    href: String,
    name: String,
    #[serde(rename = "type", default)]
    type_tag: Option<String>,
}

pub struct SmcClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    domain: Option<String>,
    registry: Registry,
    logged_in: AtomicBool,
}

impl std::fmt::Debug for SmcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmcClient")
            .field("base_url", &self.base_url)
            .field("domain", &self.domain)
            .finish()
    }
}

impl SmcClient {
    /// Builds a client from connection settings. Does not contact the server.
    pub fn new(config: &ClientConfig, api_key: SecretString, registry: Registry) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| StoreError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            api_key,
            domain: config.domain.clone(),
            registry,
            logged_in: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Opens a session.
    pub async fn login(&self) -> Result<()> {
        let mut body = json!({ "authenticationkey": self.api_key.expose_secret() });
        if let Some(domain) = &self.domain {
            body["domain"] = Value::String(domain.clone());
        }

        let response = self
            .client
            .post(format!("{}/login", self.base_url))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                self.logged_in.store(true, Ordering::SeqCst);
                log::info!("Logged in to {}", self.base_url);
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Authentication(
                "the management server rejected the API key".to_string(),
            )),
            _ => Err(error_from_response(response).await),
        }
    }

    /// Ends the session. A client that never logged in does nothing.
    pub async fn logout(&self) -> Result<()> {
        if !self.logged_in.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/logout", self.base_url))
            .send()
            .await?;
        check(response).await?;
        log::info!("Logged out of {}", self.base_url);
        Ok(())
    }

    fn entry_url(&self, type_tag: &str) -> Result<String> {
        let kind = self
            .registry
            .lookup(type_tag)
            .ok_or_else(|| StoreError::UnknownEntryPoint(type_tag.to_string()))?;
        Ok(format!("{}/elements/{}", self.base_url, kind.entry_point))
    }

    async fn fetch(&self, reference: Reference) -> Result<RemoteObject> {
        let response = check(self.client.get(&reference.href).send().await?).await?;
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let attributes = match response.json::<Value>().await? {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Decode(format!(
                    "expected an object at {}, got {}",
                    reference.href, other
                )))
            }
        };

        Ok(RemoteObject {
            reference,
            attributes,
            etag,
        })
    }

    async fn post(&self, url: &str, name: &str, attributes: &Attributes) -> Result<String> {
        let mut body = attributes.clone();
        body.insert("name".to_string(), Value::String(name.to_string()));

        let response = check(self.client.post(url).json(&body).send().await?).await?;
        location(&response)
    }
}

#[async_trait]
impl ObjectStore for SmcClient {
    async fn find(
        &self,
        type_tag: &str,
        name: &str,
        options: MatchOptions,
    ) -> Result<Vec<Reference>> {
        let url = self.entry_url(type_tag)?;
        let response = self
            .client
            .get(&url)
            .query(&[
                ("filter", name),
                ("exact_match", bool_param(options.exact)),
                ("case_sensitive", bool_param(options.case_sensitive)),
            ])
            .send()
            .await?;

        let value: Value = check(response).await?.json().await?;
        let hits = parse_search_result(value, type_tag)?;

        // The search filter also matches other attributes; keep name matches.
        Ok(hits
            .into_iter()
            .filter(|r| options.matches(&r.name, name))
            .collect())
    }

    async fn get(&self, reference: &Reference) -> Result<RemoteObject> {
        self.fetch(reference.clone()).await
    }

    async fn create(
        &self,
        type_tag: &str,
        name: &str,
        attributes: &Attributes,
    ) -> Result<Reference> {
        let url = self.entry_url(type_tag)?;
        let href = self.post(&url, name, attributes).await?;
        Ok(Reference::new(type_tag, name, href))
    }

    async fn update(&self, current: &RemoteObject, attributes: &Attributes) -> Result<()> {
        let mut body = attributes.clone();
        body.insert(
            "name".to_string(),
            Value::String(current.reference.name.clone()),
        );

        let mut request = self.client.put(&current.reference.href).json(&body);
        if let Some(etag) = &current.etag {
            request = request.header(header::IF_MATCH, etag);
        }
        check(request.send().await?).await?;
        Ok(())
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        check(self.client.delete(&reference.href).send().await?).await?;
        Ok(())
    }

    async fn children(&self, parent: &Reference, kind: &str) -> Result<Vec<RemoteObject>> {
        let url = format!("{}/{}", parent.href, kind);
        let value: Value = check(self.client.get(&url).send().await?).await?.json().await?;

        let mut children = Vec::new();
        for reference in parse_search_result(value, kind)? {
            children.push(self.fetch(reference).await?);
        }
        Ok(children)
    }

    async fn create_child(
        &self,
        parent: &Reference,
        kind: &str,
        name: &str,
        attributes: &Attributes,
    ) -> Result<Reference> {
        let url = format!("{}/{}", parent.href, kind);
        let href = self.post(&url, name, attributes).await?;
        Ok(Reference::new(kind, name, href))
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from_response(response).await)
    }
}

async fn error_from_response(response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(status, &body)
}

/// Maps a failed response to a store error.
fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("details")
                .or_else(|| v.get("message"))
                .map(|m| match m {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        })
        .unwrap_or_else(|| truncate(body));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Authentication(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        _ => StoreError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

fn truncate(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

fn location(response: &Response) -> Result<String> {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Decode("created element has no Location header".to_string()))
}

fn parse_search_result(value: Value, type_tag: &str) -> Result<Vec<Reference>> {
    let result: SearchResult =
        serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(result
        .result
        .into_iter()
        .map(|hit| {
            Reference::new(
                hit.type_tag.unwrap_or_else(|| type_tag.to_string()),
                hit.name,
                hit.href,
            )
        })
        .collect())
}
