//! HTTP API for the review dashboard and upstream generator

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::bulk::BulkApprovalCoordinator;
use crate::config::ApprovalConfig;
use crate::db::Database;
use crate::engine::ApprovalEngine;
use crate::injector::ManualMessageInjector;
use crate::query::QueryService;
use crate::store::{ConversationStore, DatabaseBackend};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ApprovalEngine<DatabaseBackend>>,
    pub bulk: Arc<BulkApprovalCoordinator<DatabaseBackend>>,
    pub injector: Arc<ManualMessageInjector<DatabaseBackend>>,
    pub query: Arc<QueryService<DatabaseBackend>>,
    /// Cancelled on shutdown; running bulk operations stop taking new items
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(db: Database, config: &ApprovalConfig, shutdown: CancellationToken) -> Self {
        let store = Arc::new(ConversationStore::new(
            DatabaseBackend::new(db),
            config.store_config(),
        ));
        let engine = Arc::new(ApprovalEngine::new(Arc::clone(&store)));
        let query = Arc::new(QueryService::new(Arc::clone(&store)));
        Self {
            bulk: Arc::new(BulkApprovalCoordinator::new(
                Arc::clone(&engine),
                Arc::clone(&query),
                config.bulk_config(),
            )),
            injector: Arc::new(ManualMessageInjector::new(
                store,
                config.injection_policy,
            )),
            engine,
            query,
            shutdown,
        }
    }
}
