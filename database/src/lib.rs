//! SQLite persistence for the task broker.
//!
//! [`SqliteStore`] implements the full store trait family from
//! `broker-core`. One pool, one embedded migration set; every multi-row
//! mutation runs in a single transaction, and the lease protocol is enforced
//! with conditional updates.

mod audit;
mod common;
mod relationships;
mod scheduling;
mod sqlite;
mod workspace;

pub use common::{sqlx_error_to_broker_error, with_read_retry};
pub use scheduling::advance_occurrence;
pub use sqlite::SqliteStore;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::SqliteStore;
    use broker_core::models::NewProject;
    use broker_core::store::WorkspaceStore;

    /// Fresh migrated in-memory store; unique name per test to avoid
    /// cross-test locking.
    pub async fn test_store() -> SqliteStore {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let thread_id = std::thread::current().id();
        let db_name = format!(":memory:test_{timestamp}_{thread_id:?}");
        let store = SqliteStore::new(&db_name).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    /// Seed one organization with one project; returns (org_id, project_id).
    pub async fn seed_org_project(store: &SqliteStore) -> (i64, i64) {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let org = store
            .create_organization("Acme", &format!("acme-{nanos}"))
            .await
            .unwrap();
        let project = store
            .create_project(
                org.id,
                NewProject {
                    name: "Main".to_string(),
                    local_path: None,
                    origin_url: None,
                    description: None,
                },
            )
            .await
            .unwrap();
        (org.id, project.id)
    }
}
