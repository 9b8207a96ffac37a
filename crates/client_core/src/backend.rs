use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Deal, DealId, StageId},
    error::{ApiErrorBody, ErrorCode},
    protocol::{InviteTeamMemberRequest, LinkCompanyRequest, MoveStageResponse},
};
use thiserror::Error;

use crate::resource::{ResourceFamily, ResourceKey};

/// Typed failure of a backend call. Rejections keep the backend's `detail`
/// string verbatim; transport failures carry no user-facing detail.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request rejected: {}", .detail.as_deref().unwrap_or("validation failed"))]
    Validation { detail: Option<String> },
    #[error("request conflicted: {}", .detail.as_deref().unwrap_or("conflict"))]
    Conflict { detail: Option<String> },
    #[error("resource not found: {}", .detail.as_deref().unwrap_or("not found"))]
    NotFound { detail: Option<String> },
    #[error("not authorized: {}", .detail.as_deref().unwrap_or("unauthorized"))]
    Unauthorized { detail: Option<String> },
    #[error("forbidden: {}", .detail.as_deref().unwrap_or("forbidden"))]
    Forbidden { detail: Option<String> },
    #[error("backend returned status {status}")]
    Server { status: u16, detail: Option<String> },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn from_status(status: u16, body: ApiErrorBody) -> Self {
        let detail = body.detail;
        match ErrorCode::from_status(status) {
            ErrorCode::Validation => Self::Validation { detail },
            ErrorCode::Conflict => Self::Conflict { detail },
            ErrorCode::NotFound => Self::NotFound { detail },
            ErrorCode::Unauthorized => Self::Unauthorized { detail },
            ErrorCode::Forbidden => Self::Forbidden { detail },
            ErrorCode::RateLimited | ErrorCode::Internal => Self::Server { status, detail },
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Validation { .. } => Some(ErrorCode::Validation),
            Self::Conflict { .. } => Some(ErrorCode::Conflict),
            Self::NotFound { .. } => Some(ErrorCode::NotFound),
            Self::Unauthorized { .. } => Some(ErrorCode::Unauthorized),
            Self::Forbidden { .. } => Some(ErrorCode::Forbidden),
            Self::Server { .. } => Some(ErrorCode::Internal),
            Self::Network(_) | Self::Decode(_) => None,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Validation { detail }
            | Self::Conflict { detail }
            | Self::NotFound { detail }
            | Self::Unauthorized { detail }
            | Self::Forbidden { detail }
            | Self::Server { detail, .. } => detail.as_deref(),
            Self::Network(_) | Self::Decode(_) => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Message for an error banner: the backend detail when present.
    pub fn user_message(&self, fallback: &str) -> String {
        self.detail().unwrap_or(fallback).to_string()
    }
}

/// Writes that invalidate the cache family they touch.
#[derive(Debug, Clone)]
pub enum Mutation {
    UpdateCompanyProfile(Value),
    InviteTeamMember(InviteTeamMemberRequest),
    UpdateCustomerProfile(Value),
    LinkCompany(LinkCompanyRequest),
}

impl Mutation {
    pub fn family(&self) -> ResourceFamily {
        match self {
            Self::UpdateCompanyProfile(_) => ResourceFamily::CompanyProfile,
            Self::InviteTeamMember(_) => ResourceFamily::CompanyTeam,
            Self::UpdateCustomerProfile(_) => ResourceFamily::CustomerProfile,
            Self::LinkCompany(_) => ResourceFamily::CustomerCompanies,
        }
    }
}

/// Boundary to the CRM REST backend. Implementations own authentication and
/// timeouts; every call resolves to a value or a typed error.
#[async_trait]
pub trait CrmBackend: Send + Sync {
    async fn fetch(&self, resource: &ResourceKey) -> Result<Value, BackendError>;
    async fn fetch_deal(&self, deal_id: DealId) -> Result<Deal, BackendError>;
    async fn move_stage(
        &self,
        deal_id: DealId,
        stage_id: StageId,
    ) -> Result<MoveStageResponse, BackendError>;
    async fn mutate(&self, mutation: &Mutation) -> Result<Value, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_keeps_detail() {
        let err = BackendError::from_status(
            400,
            ApiErrorBody::parse(r#"{"detail":"Stage belongs to a different pipeline"}"#),
        );
        assert!(matches!(err, BackendError::Validation { .. }));
        assert_eq!(
            err.user_message("Failed to move deal"),
            "Stage belongs to a different pipeline"
        );
    }

    #[test]
    fn network_errors_use_fallback_message() {
        let err = BackendError::Network("connection refused".into());
        assert!(err.detail().is_none());
        assert_eq!(err.user_message("Failed to move deal"), "Failed to move deal");
    }

    #[test]
    fn server_errors_without_body_have_no_detail() {
        let err = BackendError::from_status(502, ApiErrorBody::parse("bad gateway"));
        assert!(matches!(err, BackendError::Server { status: 502, .. }));
        assert!(err.detail().is_none());
    }

    #[test]
    fn mutations_name_their_family() {
        let invite = Mutation::InviteTeamMember(InviteTeamMemberRequest {
            email: "new@acme.test".into(),
            role: "sales_rep".into(),
        });
        assert_eq!(invite.family(), ResourceFamily::CompanyTeam);
    }
}
