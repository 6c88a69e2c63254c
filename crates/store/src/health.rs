//! Store health checks.

use tracing::{debug, error};

use crate::client::Store;

/// Check the store answers a trivial query.
pub async fn check_connection(store: &Store) -> bool {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(store.pool()).await {
        Ok(_) => {
            debug!("Store connection healthy");
            true
        }
        Err(e) => {
            error!("Store health check failed: {}", e);
            false
        }
    }
}
