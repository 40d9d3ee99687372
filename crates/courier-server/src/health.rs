use std::time::Instant;

use courier_store::Database;
use serde::Serialize;

use crate::registry::{Registry, RouteStats};

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    #[serde(flatten)]
    pub stats: RouteStats,
    pub components: Components,
}

#[derive(Clone, Debug, Serialize)]
pub struct Components {
    pub database: &'static str,
}

impl HealthReport {
    pub async fn collect(registry: &dyn Registry, db: &Database, started_at: Instant) -> Self {
        let db_ok = db
            .with_conn(|conn| {
                conn.execute_batch("SELECT 1")?;
                Ok(true)
            })
            .unwrap_or(false);

        Self {
            status: if db_ok { "healthy" } else { "degraded" },
            uptime_secs: started_at.elapsed().as_secs(),
            connections: registry.connection_count().await,
            stats: registry.stats(),
            components: Components {
                database: if db_ok { "ok" } else { "error" },
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}
