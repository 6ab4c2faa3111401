//! reqwest-backed gateway speaking the document API wire contract:
//!
//! - `GET    {base}/{app}_{collection}`            list
//! - `POST   {base}/{app}_{collection}`            create, answers with `_id`
//! - `PUT    {base}/{app}_{collection}/{serverId}` update
//! - `DELETE {base}/{app}_{collection}/{serverId}` delete
//!
//! Every request carries `x-client-id`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

use super::{GatewayError, RemoteGateway};
use crate::config::Config;
use crate::models::Document;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    app_name: String,
    client_id: String,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(
        base_url: impl Into<String>,
        app_name: impl Into<String>,
        client_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_name: app_name.into(),
            client_id: client_id.into(),
            api_key: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let gateway = Self::new(
            config.server_url.value.clone(),
            config.app_name.value.clone(),
            config.client_id.value.clone(),
            config.sync.request_timeout(),
        )?;

        Ok(match &config.sync.api_key {
            Some(key) => gateway.with_api_key(key.clone()),
            None => gateway,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// `{base}/{app}_{collection}`
    pub fn resource_url(&self, collection: &str) -> String {
        format!("{}/{}_{}", self.base_url, self.app_name, collection)
    }

    fn document_url(&self, collection: &str, server_id: &str) -> String {
        format!(
            "{}/{}",
            self.resource_url(collection),
            urlencoding::encode(server_id)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(CLIENT_ID_HEADER, &self.client_id);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn read_json(response: Response) -> Result<Value, GatewayError> {
        let text = response.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

/// Accepts a bare array or a `{"data": [...]}` envelope.
pub(crate) fn parse_list_body(collection: &str, body: Value) -> Result<Vec<Document>, GatewayError> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(GatewayError::InvalidResponse(
                    "expected an array or a 'data' array".to_string(),
                ))
            }
        },
        Value::Null => Vec::new(),
        _ => {
            return Err(GatewayError::InvalidResponse(
                "expected an array".to_string(),
            ))
        }
    };

    let mut documents = Vec::with_capacity(rows.len());
    for row in rows {
        match Document::from_remote(collection, row) {
            Ok(doc) => documents.push(doc),
            // A row without an id can never be addressed again; skip it
            Err(e) => tracing::warn!(collection, error = %e, "Skipping remote row"),
        }
    }
    Ok(documents)
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(e.to_string())
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn list(&self, collection: &str) -> Result<Vec<Document>, GatewayError> {
        let response = self
            .send(self.client.get(self.resource_url(collection)))
            .await?;
        let body = Self::read_json(response).await?;
        parse_list_body(collection, body)
    }

    async fn create(&self, collection: &str, payload: &Document) -> Result<Document, GatewayError> {
        let response = self
            .send(
                self.client
                    .post(self.resource_url(collection))
                    .json(&payload.to_remote_body()),
            )
            .await?;

        let body = Self::read_json(response).await?;
        let mut created = Document::from_remote(collection, body)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        if created.correlation_id.is_none() {
            created.correlation_id = payload.correlation_id;
        }
        Ok(created)
    }

    async fn update(
        &self,
        collection: &str,
        server_id: &str,
        payload: &Document,
    ) -> Result<Document, GatewayError> {
        let response = self
            .send(
                self.client
                    .put(self.document_url(collection, server_id))
                    .json(&payload.to_remote_body()),
            )
            .await?;

        // Some backends answer an update with a bare ack rather than the row
        let body = Self::read_json(response).await?;
        match Document::from_remote(collection, body) {
            Ok(updated) => Ok(updated),
            Err(_) => {
                let mut updated = payload.snapshot();
                updated.collection = collection.to_string();
                updated.server_id = Some(server_id.to_string());
                Ok(updated)
            }
        }
    }

    async fn delete(&self, collection: &str, server_id: &str) -> Result<(), GatewayError> {
        self.send(self.client.delete(self.document_url(collection, server_id)))
            .await?;
        Ok(())
    }
}
