//! Client core for the CRM: read-through caching of profile, team and stats
//! resources, composite screen loads, and optimistic deal stage moves on the
//! pipeline board.

pub mod backend;
pub mod board;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod http;
pub mod resource;
pub mod session;
pub mod stage_mutation;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, CrmBackend, Mutation};
pub use board::{DropEvent, PipelineBoard, StageColumn};
pub use cache::{CacheSource, CacheStore, Cached, Clock, SystemClock};
pub use config::{load_settings, load_settings_from, ClientSettings, SettingsError};
pub use coordinator::{
    CompositeLoad, DataFetchCoordinator, ResourceRequest, ScreenLoadError, ScreenState,
};
pub use http::HttpCrmBackend;
pub use resource::{ResourceFamily, ResourceKey};
pub use session::CrmSession;
pub use stage_mutation::{
    BoardEvent, IgnoreReason, MoveOperation, MoveOutcome, MoveState, StageMutationController,
    MOVE_FAILED_MESSAGE,
};
