//! Application state
//!
//! Holds all shared components and state

use std::sync::Arc;

use crate::catalog::CatalogService;
use crate::cloud_api::CloudClient;
use crate::config::AppConfig;
use crate::session::SessionManager;
use crate::stream_control::StreamController;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub session: Arc<SessionManager<CloudClient>>,
    pub catalog: Arc<CatalogService<CloudClient>>,
    pub stream: Arc<StreamController<CloudClient>>,
}
