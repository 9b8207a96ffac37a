use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{Deal, DealId, DealStatus, PipelineId, PipelineStage, StageId, UserId};

const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveStageRequest {
    pub stage_id: StageId,
}

/// Acknowledgement of `POST deals/{id}/move-stage/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveStageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub stage_id: StageId,
    pub probability: u8,
}

/// A related record that the backend renders either as a bare id or as a
/// nested object depending on the serializer in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(i64),
    Object {
        id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl EntityRef {
    pub fn id(&self) -> i64 {
        match self {
            Self::Id(id) => *id,
            Self::Object { id, .. } => *id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Object { name, .. } => name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealPayload {
    pub id: DealId,
    #[serde(default)]
    pub title: String,
    #[serde(deserialize_with = "de_decimal", default)]
    pub value: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub status: DealStatus,
    #[serde(default)]
    pub probability: u8,
    pub stage: EntityRef,
    pub pipeline: EntityRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<DealPayload> for Deal {
    fn from(payload: DealPayload) -> Self {
        Self {
            id: payload.id,
            title: payload.title,
            stage_id: StageId(payload.stage.id()),
            stage_name: payload.stage.name().map(str::to_owned),
            pipeline_id: PipelineId(payload.pipeline.id()),
            value: payload.value,
            currency: payload.currency,
            status: payload.status,
            probability: payload.probability,
            assigned_to_user_id: payload.assigned_to.map(|user| UserId(user.id())),
            updated_at: payload.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub id: StageId,
    pub name: String,
    pub order: i32,
    pub probability: u8,
}

impl From<StageSummary> for PipelineStage {
    fn from(stage: StageSummary) -> Self {
        Self {
            id: stage.id,
            name: stage.name,
            order: stage.order,
            win_probability_percent: stage.probability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageBucket {
    pub stage: StageSummary,
    #[serde(default)]
    pub deals: Vec<DealPayload>,
}

/// Body of `GET deals/by-stage/`, keyed by stage id rendered as a string.
pub type DealsByStageResponse = BTreeMap<String, StageBucket>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageAggregate {
    pub count: u64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealStats {
    #[serde(default)]
    pub total_deals_value: f64,
    #[serde(default)]
    pub deals_by_stage: BTreeMap<String, StageAggregate>,
    #[serde(default)]
    pub win_rate_percent: f64,
    #[serde(default)]
    pub average_deal_size: f64,
    #[serde(default)]
    pub average_days_to_close: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamRoster {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub team_members: Vec<TeamMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteTeamMemberRequest {
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCompanyRequest {
    pub company_code: String,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_true() -> bool {
    true
}

/// Money fields come back from the backend as decimal strings (`"1500.00"`)
/// or plain numbers depending on the endpoint.
fn de_decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Null(()),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) if text.trim().is_empty() => Ok(0.0),
        Raw::Text(text) => text.trim().parse::<f64>().map_err(serde::de::Error::custom),
        Raw::Null(()) => Ok(0.0),
    }
}
