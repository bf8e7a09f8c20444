use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use huddle_types::User;
use huddle_types::api::{ApiErrorBody, PasswordSignIn, SessionResponse};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// A PostgREST filter: `(column, "op.value")`.
pub type Filter<'a> = (&'a str, String);

pub fn eq(column: &str, value: impl ToString) -> Filter<'_> {
    (column, format!("eq.{}", value.to_string()))
}

/// HTTP client for the table API and the auth API.
///
/// Every request carries the public key; once signed in it also carries the
/// user's access token, which is what row-level security keys off.
pub struct RestClient {
    http: reqwest::Client,
    config: ClientConfig,
    access_token: RwLock<Option<String>>,
}

impl RestClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            config,
            access_token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn access_token(&self) -> Option<String> {
        self.token().clone()
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.token_mut() = token;
    }

    // -- Auth --

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SessionResponse> {
        let url = self.config.auth_url("token?grant_type=password");
        let body = PasswordSignIn {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session: SessionResponse = self.send(self.request(Method::POST, url).json(&body)).await?;
        debug!("Signed in as {}", session.user.id);
        self.set_access_token(Some(session.access_token.clone()));
        Ok(session)
    }

    pub async fn get_user(&self) -> Result<User> {
        if self.token().is_none() {
            return Err(ClientError::NotSignedIn);
        }
        let url = self.config.auth_url("user");
        self.send(self.request(Method::GET, url)).await
    }

    /// Revokes the access token. The local token is kept if the server
    /// never confirms.
    pub async fn logout(&self) -> Result<()> {
        if self.token().is_none() {
            return Err(ClientError::NotSignedIn);
        }
        let url = self.config.auth_url("logout");
        check(self.request(Method::POST, url).send().await?).await?;
        self.set_access_token(None);
        Ok(())
    }

    // -- Tables --

    pub async fn select<T: DeserializeOwned>(&self, table: &str, columns: &str, filters: &[Filter<'_>], order: Option<&str>) -> Result<Vec<T>> {
        let mut url = self.config.rest_url(table);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", columns);
            for (column, condition) in filters {
                query.append_pair(column, condition);
            }
            if let Some(order) = order {
                query.append_pair("order", order);
            }
        }
        self.send(self.request(Method::GET, url)).await
    }

    /// Inserts one row and returns what the server stored.
    pub async fn insert<B: Serialize, T: DeserializeOwned>(&self, table: &str, body: &B) -> Result<Vec<T>> {
        let url = self.config.rest_url(table);
        let req = self.request(Method::POST, url).header("Prefer", "return=representation").json(body);
        self.send(req).await
    }

    pub async fn update<B: Serialize, T: DeserializeOwned>(&self, table: &str, filters: &[Filter<'_>], body: &B) -> Result<Vec<T>> {
        let url = filtered(self.config.rest_url(table), filters);
        let req = self.request(Method::PATCH, url).header("Prefer", "return=representation").json(body);
        self.send(req).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, table: &str, filters: &[Filter<'_>]) -> Result<Vec<T>> {
        let url = filtered(self.config.rest_url(table), filters);
        let req = self.request(Method::DELETE, url).header("Prefer", "return=representation");
        self.send(req).await
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let bearer = self.token().clone().unwrap_or_else(|| self.config.anon_key.clone());
        let mut req = self.http.request(method, url).header("apikey", &self.config.anon_key);
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", bearer)) {
            req = req.header(AUTHORIZATION, value);
        }
        req
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = check(req.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }

    fn token(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.access_token.read().unwrap_or_else(|e| e.into_inner())
    }

    fn token_mut(&self) -> RwLockWriteGuard<'_, Option<String>> {
        self.access_token.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn filtered(mut url: Url, filters: &[Filter<'_>]) -> Url {
    {
        let mut query = url.query_pairs_mut();
        for (column, condition) in filters {
            query.append_pair(column, condition);
        }
    }
    url
}

/// Turns a non-success response into `ClientError::Backend`, keeping the
/// server's own message when it sent one.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = error_message(status, &text);
    warn!("Request failed ({}): {}", status.as_u16(), message);
    Err(ClientError::Backend {
        status: status.as_u16(),
        message,
    })
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.summary())
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string())
}
