//! reqwest implementation of [`CrmBackend`] against the CRM REST API.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{Deal, DealId, StageId},
    error::ApiErrorBody,
    protocol::{DealPayload, MoveStageRequest, MoveStageResponse},
};
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, CrmBackend, Mutation},
    config::ClientSettings,
    resource::{ResourceFamily, ResourceKey},
};

pub struct HttpCrmBackend {
    http: Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
}

impl HttpCrmBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, BackendError> {
        let backend = Self::new(
            &settings.api_base_url,
            Duration::from_secs(settings.request_timeout_seconds),
        )?;
        backend.set_access_token(settings.access_token.clone());
        Ok(backend)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .http
            .request(method, format!("{}/{}", self.base_url, path));
        match self.access_token.read().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, BackendError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let url = response.url().clone();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let err = BackendError::from_status(status.as_u16(), ApiErrorBody::parse(&body));
            warn!(%url, status = status.as_u16(), error = %err, "http: request rejected");
            return Err(err);
        }
        debug!(%url, status = status.as_u16(), "http: request completed");

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| BackendError::Decode(format!("{url}: {err}")))
    }

    async fn send_typed<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let value = self.send(request).await?;
        serde_json::from_value(value).map_err(|err| BackendError::Decode(err.to_string()))
    }
}

#[async_trait]
impl CrmBackend for HttpCrmBackend {
    async fn fetch(&self, resource: &ResourceKey) -> Result<Value, BackendError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(scope) = resource.scope() {
            query.push(("pipeline_id", scope));
        }
        query.extend(
            resource
                .filters()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );

        let request = self
            .request(Method::GET, resource_path(resource.family()))
            .query(&query);
        self.send(request).await
    }

    async fn fetch_deal(&self, deal_id: DealId) -> Result<Deal, BackendError> {
        let payload: DealPayload = self
            .send_typed(self.request(Method::GET, &format!("deals/{deal_id}/")))
            .await?;
        Ok(payload.into())
    }

    async fn move_stage(
        &self,
        deal_id: DealId,
        stage_id: StageId,
    ) -> Result<MoveStageResponse, BackendError> {
        let request = self
            .request(Method::POST, &format!("deals/{deal_id}/move-stage/"))
            .json(&MoveStageRequest { stage_id });
        self.send_typed(request).await
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Value, BackendError> {
        let request = match mutation {
            Mutation::UpdateCompanyProfile(body) => self
                .request(Method::PUT, "auth/company/profile/")
                .json(body),
            Mutation::InviteTeamMember(invite) => self
                .request(Method::POST, "auth/company/invite/")
                .json(invite),
            Mutation::UpdateCustomerProfile(body) => self
                .request(Method::PUT, "auth/customer/profile/")
                .json(body),
            Mutation::LinkCompany(link) => self
                .request(Method::POST, "auth/customer/link-company/")
                .json(link),
        };
        self.send(request).await
    }
}

fn resource_path(family: ResourceFamily) -> &'static str {
    match family {
        ResourceFamily::CompanyProfile => "auth/company/profile/",
        ResourceFamily::CompanyTeam => "auth/company/team/",
        ResourceFamily::CompanyStats => "auth/company/stats/",
        ResourceFamily::CustomerProfile => "auth/customer/profile/",
        ResourceFamily::CustomerCompanies => "auth/customer/companies/",
        ResourceFamily::DealBoard => "deals/by-stage/",
        ResourceFamily::DealStats => "deals/stats/",
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::Decode(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
