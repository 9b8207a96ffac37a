//! Per-login service facade. Owns the cache for the lifetime of a session and
//! hands the same instance to every reader and to the board controller.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{DealId, PipelineId, StageId},
    protocol::{
        DealStats, DealsByStageResponse, InviteTeamMemberRequest, LinkCompanyRequest, TeamRoster,
    },
};
use storage::{KeyValueStore, MemoryStore, Storage};
use tracing::info;

use crate::{
    backend::{BackendError, CrmBackend, Mutation},
    board::{DropEvent, PipelineBoard},
    cache::{CacheStore, Cached},
    config::{prepare_database_url, ClientSettings},
    coordinator::{CompositeLoad, DataFetchCoordinator, ResourceRequest},
    http::HttpCrmBackend,
    resource::{ResourceFamily, ResourceKey},
    stage_mutation::{MoveOutcome, StageMutationController},
};

pub struct CrmSession {
    backend: Arc<dyn CrmBackend>,
    cache: Arc<CacheStore>,
    coordinator: DataFetchCoordinator,
    board: StageMutationController,
    ttl: Duration,
}

impl CrmSession {
    pub fn new(backend: Arc<dyn CrmBackend>, cache: Arc<CacheStore>, ttl: Duration) -> Self {
        Self {
            coordinator: DataFetchCoordinator::new(Arc::clone(&cache), Arc::clone(&backend)),
            board: StageMutationController::new(
                Arc::clone(&backend),
                Arc::clone(&cache),
                PipelineBoard::default(),
            ),
            backend,
            cache,
            ttl,
        }
    }

    /// Builds the HTTP backend and a sqlite-backed cache, or an in-memory one
    /// when no cache database is configured.
    pub async fn from_settings(settings: &ClientSettings) -> anyhow::Result<Self> {
        settings.validate()?;

        let store: Arc<dyn KeyValueStore> = match &settings.cache_database_url {
            Some(raw) => {
                let database_url = prepare_database_url(raw)?;
                Arc::new(
                    Storage::new(&database_url)
                        .await
                        .with_context(|| format!("failed to open cache at '{database_url}'"))?,
                )
            }
            None => Arc::new(MemoryStore::new()),
        };
        let backend =
            HttpCrmBackend::from_settings(settings).context("failed to build http client")?;

        info!(
            api_base_url = %settings.api_base_url,
            persistent_cache = settings.cache_database_url.is_some(),
            "session: ready"
        );
        Ok(Self::new(
            Arc::new(backend),
            Arc::new(CacheStore::new(store)),
            settings.cache_ttl(),
        ))
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &DataFetchCoordinator {
        &self.coordinator
    }

    pub fn board(&self) -> &StageMutationController {
        &self.board
    }

    async fn read<T>(&self, resource: ResourceKey) -> Result<Cached<T>, BackendError>
    where
        T: Serialize + DeserializeOwned,
    {
        let backend = Arc::clone(&self.backend);
        let key = &resource;
        self.cache
            .read_resource(&resource, self.ttl, move || async move {
                backend.fetch(key).await.and_then(|value| {
                    serde_json::from_value::<T>(value)
                        .map_err(|err| BackendError::Decode(format!("{key}: {err}")))
                })
            })
            .await
    }

    pub async fn company_profile(&self) -> Result<Cached<Value>, BackendError> {
        self.read(ResourceKey::new(ResourceFamily::CompanyProfile))
            .await
    }

    /// Team roster. Filtered queries always go to the network.
    pub async fn company_team(
        &self,
        filters: &[(&str, &str)],
    ) -> Result<Cached<TeamRoster>, BackendError> {
        let resource = filters
            .iter()
            .fold(ResourceKey::new(ResourceFamily::CompanyTeam), |key, (name, value)| {
                key.with_filter(*name, *value)
            });
        self.read(resource).await
    }

    pub async fn company_stats(&self) -> Result<Cached<Value>, BackendError> {
        self.read(ResourceKey::new(ResourceFamily::CompanyStats))
            .await
    }

    pub async fn customer_profile(&self) -> Result<Cached<Value>, BackendError> {
        self.read(ResourceKey::new(ResourceFamily::CustomerProfile))
            .await
    }

    pub async fn linked_companies(&self) -> Result<Cached<Value>, BackendError> {
        self.read(ResourceKey::new(ResourceFamily::CustomerCompanies))
            .await
    }

    /// Deal aggregates across every company the caller belongs to. The
    /// backend does not break these down per pipeline.
    pub async fn deal_stats(&self) -> Result<Cached<DealStats>, BackendError> {
        self.read(ResourceKey::new(ResourceFamily::DealStats)).await
    }

    /// Reads the stage grouping for `pipeline_id` and installs it as the board
    /// the controller mutates.
    pub async fn load_board(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<Cached<PipelineBoard>, BackendError> {
        let grouped: Cached<DealsByStageResponse> = self
            .read(ResourceKey::scoped(ResourceFamily::DealBoard, pipeline_id))
            .await?;
        let source = grouped.source;
        let board = PipelineBoard::from_by_stage(Some(pipeline_id), grouped.value);
        self.board.replace_board(board.clone());
        info!(
            pipeline_id = %pipeline_id,
            deals = board.deal_count(),
            source = ?source,
            "session: board loaded"
        );
        Ok(Cached {
            value: board,
            source,
        })
    }

    pub async fn refresh_board(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<Cached<PipelineBoard>, BackendError> {
        if let Some(cache_key) =
            ResourceKey::scoped(ResourceFamily::DealBoard, pipeline_id).cache_key()
        {
            self.cache.invalidate(&cache_key).await;
        }
        self.load_board(pipeline_id).await
    }

    pub async fn handle_drop(&self, event: DropEvent) -> MoveOutcome {
        self.board.handle_drop(event).await
    }

    pub async fn move_deal(&self, deal_id: DealId, to_stage_id: StageId) -> MoveOutcome {
        self.board.move_deal(deal_id, to_stage_id).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Value, BackendError> {
        let result = self.backend.mutate(&mutation).await?;
        let family = mutation.family();
        self.cache.invalidate_family(family.prefix()).await;
        info!(family = family.prefix(), "session: mutation applied");
        Ok(result)
    }

    pub async fn update_company_profile(&self, changes: Value) -> Result<Value, BackendError> {
        self.mutate(Mutation::UpdateCompanyProfile(changes)).await
    }

    pub async fn invite_team_member(
        &self,
        email: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<Value, BackendError> {
        self.mutate(Mutation::InviteTeamMember(InviteTeamMemberRequest {
            email: email.into(),
            role: role.into(),
        }))
        .await
    }

    pub async fn update_customer_profile(&self, changes: Value) -> Result<Value, BackendError> {
        self.mutate(Mutation::UpdateCustomerProfile(changes)).await
    }

    pub async fn link_company(
        &self,
        company_code: impl Into<String>,
    ) -> Result<Value, BackendError> {
        self.mutate(Mutation::LinkCompany(LinkCompanyRequest {
            company_code: company_code.into(),
        }))
        .await
    }

    pub async fn clear_company_cache(&self) {
        for family in ResourceFamily::COMPANY {
            self.cache.invalidate_family(family.prefix()).await;
        }
    }

    fn company_dashboard(&self) -> Vec<ResourceRequest> {
        vec![
            ResourceRequest::new(ResourceKey::new(ResourceFamily::CompanyProfile), self.ttl),
            ResourceRequest::new(ResourceKey::new(ResourceFamily::CompanyStats), self.ttl),
        ]
    }

    fn customer_dashboard(&self) -> Vec<ResourceRequest> {
        vec![
            ResourceRequest::new(ResourceKey::new(ResourceFamily::CustomerProfile), self.ttl),
            ResourceRequest::new(
                ResourceKey::new(ResourceFamily::CustomerCompanies),
                self.ttl,
            ),
        ]
    }

    pub async fn load_company_dashboard(&self) -> CompositeLoad {
        self.coordinator
            .load_composite(self.company_dashboard())
            .await
    }

    pub async fn refresh_company_dashboard(&self) -> CompositeLoad {
        self.coordinator.refresh(self.company_dashboard()).await
    }

    pub async fn load_customer_dashboard(&self) -> CompositeLoad {
        self.coordinator
            .load_composite(self.customer_dashboard())
            .await
    }

    pub async fn refresh_customer_dashboard(&self) -> CompositeLoad {
        self.coordinator.refresh(self.customer_dashboard()).await
    }

    /// Tears down everything cached for this login.
    pub async fn logout(&self) {
        self.cache.clear().await;
        self.board.replace_board(PipelineBoard::default());
        info!("session: cache cleared on logout");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
