//! Remote store speaking a PostgREST-style table API.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::config::Config;
use crate::model::{Entity, Scope};

/// REST client for one remote table.
pub struct RestRemoteStore<T> {
  client: reqwest::Client,
  table_url: Url,
  api_key: String,
  access_token: Option<String>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RestRemoteStore<T> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      table_url: self.table_url.clone(),
      api_key: self.api_key.clone(),
      access_token: self.access_token.clone(),
      _marker: PhantomData,
    }
  }
}

impl<T: Entity> RestRemoteStore<T> {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token();

    let base = Url::parse(&config.remote.url)
      .map_err(|e| eyre!("Invalid remote url {}: {}", config.remote.url, e))?;
    let table_url = base
      .join(&format!("rest/v1/{}", T::table()))
      .map_err(|e| eyre!("Invalid table url for {}: {}", T::table(), e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.remote.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      table_url,
      api_key,
      access_token,
      _marker: PhantomData,
    })
  }

  fn request(&self, method: Method, filters: &[(String, String)]) -> RequestBuilder {
    let mut url = self.table_url.clone();
    {
      let mut query = url.query_pairs_mut();
      for (column, value) in filters {
        query.append_pair(column, &format!("eq.{}", value));
      }
    }

    let token = self.access_token.as_deref().unwrap_or(&self.api_key);
    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .header(header::AUTHORIZATION, format!("Bearer {}", token))
  }

  fn by_id(id: &str) -> Vec<(String, String)> {
    vec![("id".to_string(), id.to_string())]
  }
}

/// Send a request and classify failures.
async fn send(request: RequestBuilder) -> Result<Response, RemoteError> {
  let response = request.send().await.map_err(transport_error)?;
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let url = response.url().path().to_string();
  let body = response.text().await.unwrap_or_default();
  Err(classify(status, &url, &body))
}

fn transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_decode() {
    RemoteError::Decode(e.to_string())
  } else {
    RemoteError::Offline(e.to_string())
  }
}

/// Map a non-success status to the error taxonomy.
fn classify(status: StatusCode, path: &str, body: &str) -> RemoteError {
  if status == StatusCode::NOT_FOUND {
    return RemoteError::NotFound(path.to_string());
  }
  if status.is_server_error()
    || status == StatusCode::TOO_MANY_REQUESTS
    || status == StatusCode::REQUEST_TIMEOUT
  {
    return RemoteError::Unavailable {
      status: status.as_u16(),
    };
  }

  // PostgREST errors carry a JSON body with a "message" field
  let message = serde_json::from_str::<serde_json::Value>(body)
    .ok()
    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
    .unwrap_or_else(|| {
      if body.is_empty() {
        status.to_string()
      } else {
        body.to_string()
      }
    });

  RemoteError::Rejected {
    status: status.as_u16(),
    message,
  }
}

async fn decode_rows<T: Entity>(response: Response) -> Result<Vec<T>, RemoteError> {
  response
    .json::<Vec<T>>()
    .await
    .map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl<T: Entity> RemoteStore<T> for RestRemoteStore<T> {
  async fn fetch_list(&self, scope: &Scope) -> Result<Vec<T>, RemoteError> {
    debug!(table = T::table(), scope = %scope, "fetching list");
    let response = send(self.request(Method::GET, scope.filters())).await?;
    decode_rows(response).await
  }

  async fn fetch_details(&self, id: &str) -> Result<Option<T>, RemoteError> {
    let response = send(self.request(Method::GET, &Self::by_id(id))).await?;
    Ok(decode_rows::<T>(response).await?.into_iter().next())
  }

  async fn create(&self, entity: &T) -> Result<String, RemoteError> {
    // Upsert on the primary key so a replayed create converges on one row
    let request = self
      .request(Method::POST, &[])
      .header("Prefer", "return=representation,resolution=merge-duplicates")
      .json(entity);

    let response = send(request).await?;
    let created = decode_rows::<T>(response).await?;
    Ok(
      created
        .first()
        .map(|row| row.id().to_string())
        .unwrap_or_else(|| entity.id().to_string()),
    )
  }

  async fn update(&self, id: &str, patch: &serde_json::Value) -> Result<(), RemoteError> {
    let request = self
      .request(Method::PATCH, &Self::by_id(id))
      .header("Prefer", "return=minimal")
      .json(patch);

    send(request).await?;
    Ok(())
  }

  async fn delete(&self, id: &str) -> Result<(), RemoteError> {
    let request = self
      .request(Method::DELETE, &Self::by_id(id))
      .header("Prefer", "return=representation");

    let response = send(request).await?;
    // A missing row and one a row-level policy hides both come back empty
    if decode_rows::<T>(response).await?.is_empty() {
      return Err(RemoteError::NotFound(id.to_string()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_statuses() {
    assert!(matches!(
      classify(StatusCode::NOT_FOUND, "/rest/v1/x", ""),
      RemoteError::NotFound(_)
    ));
    assert!(classify(StatusCode::BAD_GATEWAY, "/", "").is_transient());
    assert!(classify(StatusCode::TOO_MANY_REQUESTS, "/", "").is_transient());

    let rejected = classify(
      StatusCode::CONFLICT,
      "/",
      r#"{"code":"23505","message":"duplicate key value"}"#,
    );
    assert_eq!(
      rejected,
      RemoteError::Rejected {
        status: 409,
        message: "duplicate key value".to_string()
      }
    );
    assert!(!rejected.is_transient());
  }

  #[test]
  fn test_classify_plain_body() {
    let rejected = classify(StatusCode::BAD_REQUEST, "/", "");
    assert_eq!(
      rejected,
      RemoteError::Rejected {
        status: 400,
        message: "400 Bad Request".to_string()
      }
    );
  }
}
