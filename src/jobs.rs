use crate::errors::CrabError;
use crate::storage;
use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub auth_codes: u64,
    pub device_authorizations: u64,
    pub token_sessions: u64,
    pub properties: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.auth_codes + self.device_authorizations + self.token_sessions + self.properties
    }
}

/// Deletes every expired row. Reads already ignore expired rows, so this is hygiene only.
pub async fn run_cleanup(db: &DatabaseConnection) -> Result<CleanupReport, CrabError> {
    Ok(CleanupReport {
        auth_codes: storage::cleanup_expired_auth_codes(db).await?,
        device_authorizations: storage::cleanup_expired_device_authorizations(db).await?,
        token_sessions: storage::cleanup_expired_token_sessions(db).await?,
        properties: storage::cleanup_expired_properties(db).await?,
    })
}

/// Initialize and start the job scheduler with the hourly cleanup task
pub async fn init_scheduler(db: DatabaseConnection) -> Result<JobScheduler, CrabError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| CrabError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let cleanup_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let db = db.clone();
        Box::pin(async move {
            info!("Running cleanup_expired job");
            match run_cleanup(&db).await {
                Ok(report) => info!(
                    auth_codes = report.auth_codes,
                    device_authorizations = report.device_authorizations,
                    token_sessions = report.token_sessions,
                    properties = report.properties,
                    "Cleaned up {} expired rows",
                    report.total()
                ),
                Err(e) => error!("Failed to cleanup expired rows: {}", e),
            }
        })
    })
    .map_err(|e| CrabError::Other(format!("Failed to create cleanup job: {}", e)))?;

    sched
        .add(cleanup_job)
        .await
        .map_err(|e| CrabError::Other(format!("Failed to add cleanup job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| CrabError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started");

    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewAuthCode;
    use crate::test_support::TestDb;

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_rows() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let expired = storage::issue_auth_code(
            db,
            NewAuthCode {
                client_id: "c1".to_string(),
                subject: "user-1".to_string(),
                ..Default::default()
            },
            0,
        )
        .await
        .unwrap();
        let live = storage::issue_auth_code(
            db,
            NewAuthCode {
                client_id: "c1".to_string(),
                subject: "user-1".to_string(),
                ..Default::default()
            },
            3600,
        )
        .await
        .unwrap();
        storage::create_token_session(db, "at", "c1", "user-1", None, 0)
            .await
            .unwrap();
        storage::set_property(db, "owner", "stale", &serde_json::json!(1), Some(0))
            .await
            .unwrap();
        storage::set_property(db, "owner", "kept", &serde_json::json!(2), None)
            .await
            .unwrap();

        let report = run_cleanup(db).await.unwrap();
        assert_eq!(report.auth_codes, 1);
        assert_eq!(report.token_sessions, 1);
        assert_eq!(report.properties, 1);
        assert_eq!(report.device_authorizations, 0);

        assert!(storage::consume_auth_code(db, &expired.code).await.unwrap().is_none());
        assert!(storage::consume_auth_code(db, &live.code).await.unwrap().is_some());
        assert!(storage::get_property(db, "owner", "kept").await.unwrap().is_some());

        assert_eq!(run_cleanup(db).await.unwrap().total(), 0);
    }
}
