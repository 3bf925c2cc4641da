//! End-to-end store tests against in-memory SQLite: the lease protocol under
//! contention, propagation, cycle refusal, the reclaimer primitive, tenancy,
//! audit streams, and the auxiliary surfaces.

use broker_core::{
    error::BrokerError,
    models::{
        AgentType, CompletionOutcome, NewComment, NewProject, NewRecurrence, NewTask, NewTemplate,
        Priority, RecurrenceConfig, RecurrenceType, RelationshipType, StaleWarning, TaskFilter,
        TaskOrder, TaskPatch, TaskStatus, TaskType, UpdateType, VerificationStatus, SYSTEM_AGENT,
    },
    store::{AuditStore, RecurrenceStore, RelationshipStore, TaskStore, WorkspaceStore},
};
use broker_db::SqliteStore;
use chrono::{Duration, Utc};

async fn test_store() -> SqliteStore {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let thread_id = std::thread::current().id();
    let db_name = format!(":memory:itest_{timestamp}_{thread_id:?}");
    let store = SqliteStore::new(&db_name).await.unwrap();
    store.migrate().await.unwrap();
    store
}

async fn seed(store: &SqliteStore) -> (i64, i64) {
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
                local_path: Some("/srv/main".to_string()),
                origin_url: None,
                description: None,
            },
        )
        .await
        .unwrap();
    (org.id, project.id)
}

async fn make_task(store: &SqliteStore, org: i64, project: i64, title: &str) -> i64 {
    make_typed_task(store, org, project, title, TaskType::Concrete).await
}

async fn make_typed_task(
    store: &SqliteStore,
    org: i64,
    project: i64,
    title: &str,
    task_type: TaskType,
) -> i64 {
    let mut task = NewTask::new(title, task_type, "do the thing", "confirm the thing");
    task.project_id = Some(project);
    store.create_task(org, task, "seeder").await.unwrap().id
}

/// Push a task's updated_at into the past, simulating an idle lease.
async fn age_task(store: &SqliteStore, task_id: i64, hours: i64) {
    sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::hours(hours))
        .bind(task_id)
        .execute(store.pool())
        .await
        .unwrap();
}

// --- Lease protocol ---

#[tokio::test]
async fn concurrent_reserve_has_exactly_one_winner() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "contended").await;

    let mut handles = Vec::new();
    for agent in ["a1", "a2", "a3", "a4", "a5"] {
        let store = store.clone();
        let agent = agent.to_string();
        handles.push(tokio::spawn(
            async move { store.reserve(org, task_id, &agent).await },
        ));
    }
    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one reserve must win");
    for loser in results.iter().filter(|r| r.is_err()) {
        match loser.as_ref().unwrap_err() {
            BrokerError::NotReservable { holder, .. } => assert!(holder.is_some()),
            other => panic!("expected NotReservable, got {other:?}"),
        }
    }

    let task = store.get_task(org, task_id).await.unwrap().unwrap();
    assert_eq!(task.task_status, TaskStatus::InProgress);
    assert!(task.assigned_agent.is_some());
    assert!(task.started_at.is_some());
}

#[tokio::test]
async fn reserve_then_unlock_round_trip() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "round trip").await;

    let reserved = store.reserve(org, task_id, "a1").await.unwrap();
    assert_eq!(reserved.assigned_agent.as_deref(), Some("a1"));

    let unlocked = store.unlock(org, task_id, "a1").await.unwrap();
    assert_eq!(unlocked.task_status, TaskStatus::Available);
    assert!(unlocked.assigned_agent.is_none());
    assert!(unlocked.started_at.is_some(), "started_at survives unlock");
}

#[tokio::test]
async fn non_owner_cannot_unlock_or_complete() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "owned").await;
    store.reserve(org, task_id, "a1").await.unwrap();

    let err = store.unlock(org, task_id, "a2").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotAssigned { .. }));

    let err = store
        .complete(org, task_id, "a2", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotAssigned { .. }));

    // State unchanged
    let task = store.get_task(org, task_id).await.unwrap().unwrap();
    assert_eq!(task.task_status, TaskStatus::InProgress);
    assert_eq!(task.assigned_agent.as_deref(), Some("a1"));
}

#[tokio::test]
async fn complete_fills_actual_hours_and_clears_lease() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "finish me").await;
    store.reserve(org, task_id, "a1").await.unwrap();

    let outcome = store
        .complete(org, task_id, "a1", Some("done".to_string()), Some(2.5))
        .await
        .unwrap();
    let task = match outcome {
        CompletionOutcome::Completed(task) => task,
        other => panic!("expected Completed, got {other:?}"),
    };

    assert_eq!(task.task_status, TaskStatus::Complete);
    assert_eq!(task.verification_status, VerificationStatus::Unverified);
    assert!(task.completed_at.is_some());
    assert!(task.assigned_agent.is_none());
    assert_eq!(task.actual_hours, Some(2.5));
    assert_eq!(task.notes.as_deref(), Some("done"));
}

#[tokio::test]
async fn verification_lease_full_cycle() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "verify me").await;

    store.reserve(org, task_id, "a1").await.unwrap();
    store
        .complete(org, task_id, "a1", None, None)
        .await
        .unwrap();

    // The completed-but-unverified task is offered to implementation agents
    // ahead of plain available work.
    let available = store
        .available_for_agent(org, AgentType::Implementation, None, 10)
        .await
        .unwrap();
    assert!(available.iter().any(|t| t.id == task_id));
    assert_eq!(available[0].id, task_id, "needs-verification bucket first");

    // Breakdown agents never see it.
    let breakdown = store
        .available_for_agent(org, AgentType::Breakdown, None, 10)
        .await
        .unwrap();
    assert!(breakdown.iter().all(|t| t.id != task_id));

    // Reserving for verification keeps completed_at.
    let leased = store.reserve(org, task_id, "a2").await.unwrap();
    assert_eq!(leased.task_status, TaskStatus::InProgress);
    assert!(leased.completed_at.is_some());

    // Completing the verification lease verifies.
    let outcome = store
        .complete(org, task_id, "a2", None, None)
        .await
        .unwrap();
    assert!(outcome.verified());
    let task = store.get_task(org, task_id).await.unwrap().unwrap();
    assert_eq!(task.task_status, TaskStatus::Complete);
    assert_eq!(task.verification_status, VerificationStatus::Verified);

    let history = store.change_history(org, task_id, 50).await.unwrap();
    let kinds: Vec<&str> = history.iter().map(|h| h.change_type.as_str()).collect();
    assert!(kinds.contains(&"completed"));
    assert!(kinds.contains(&"verified"));
    assert!(kinds.contains(&"locked_for_verification"));
}

#[tokio::test]
async fn unlocking_a_verification_lease_restores_complete() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "bail out").await;

    store.reserve(org, task_id, "a1").await.unwrap();
    store
        .complete(org, task_id, "a1", None, None)
        .await
        .unwrap();
    store.reserve(org, task_id, "a2").await.unwrap();

    let released = store.unlock(org, task_id, "a2").await.unwrap();
    assert_eq!(released.task_status, TaskStatus::Complete);
    assert_eq!(released.verification_status, VerificationStatus::Unverified);
    assert!(released.completed_at.is_some());
}

#[tokio::test]
async fn verify_is_refused_twice() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "double verify").await;

    store.reserve(org, task_id, "a1").await.unwrap();
    store
        .complete(org, task_id, "a1", None, None)
        .await
        .unwrap();
    store
        .verify(org, task_id, "a2", Some("looks right".to_string()))
        .await
        .unwrap();

    let err = store.verify(org, task_id, "a3", None).await.unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyVerified(_)));

    // Completing an already-verified task is the same refusal.
    let err = store
        .complete(org, task_id, "a1", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyVerified(_)));
}

#[tokio::test]
async fn bulk_unlock_reports_per_task_and_strict_mode_rolls_back() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let t1 = make_task(&store, org, project, "one").await;
    let t2 = make_task(&store, org, project, "two").await;
    let t3 = make_task(&store, org, project, "three").await;
    store.reserve(org, t1, "a1").await.unwrap();
    store.reserve(org, t2, "a1").await.unwrap();
    store.reserve(org, t3, "someone-else").await.unwrap();

    // Lenient mode: two unlock, one reports failure.
    let report = store
        .bulk_unlock(org, &[t1, t2, t3], "a1", false)
        .await
        .unwrap();
    assert_eq!(report.unlocked, vec![t1, t2]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, t3);

    // Strict mode: any failure rolls everything back.
    store.reserve(org, t1, "a1").await.unwrap();
    let report = store
        .bulk_unlock(org, &[t1, t3], "a1", true)
        .await
        .unwrap();
    assert!(report.unlocked.is_empty());
    assert_eq!(report.failed.len(), 1);
    let task = store.get_task(org, t1).await.unwrap().unwrap();
    assert_eq!(
        task.task_status,
        TaskStatus::InProgress,
        "strict failure must leave the batch untouched"
    );
}

// --- Propagation ---

#[tokio::test]
async fn parent_auto_completes_when_all_subtasks_complete() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let parent = make_typed_task(&store, org, project, "Parent", TaskType::Abstract).await;
    let c1 = make_task(&store, org, project, "Child 1").await;
    let c2 = make_task(&store, org, project, "Child 2").await;
    let c3 = make_task(&store, org, project, "Child 3").await;
    for child in [c1, c2, c3] {
        store
            .create_relationship(org, parent, child, RelationshipType::Subtask, "seeder")
            .await
            .unwrap();
    }

    let children = store.subtask_children(org, parent).await.unwrap();
    assert_eq!(children.len(), 3);

    for child in [c1, c2] {
        store.reserve(org, child, "a1").await.unwrap();
        store.complete(org, child, "a1", None, None).await.unwrap();
        let p = store.get_task(org, parent).await.unwrap().unwrap();
        assert_eq!(p.task_status, TaskStatus::Available);
    }

    store.reserve(org, c3, "a1").await.unwrap();
    store.complete(org, c3, "a1", None, None).await.unwrap();

    let p = store.get_task(org, parent).await.unwrap().unwrap();
    assert_eq!(p.task_status, TaskStatus::Complete);
    assert!(p.completed_at.is_some());
    assert!(p.notes.unwrap().starts_with("Auto-completed"));

    let history = store.change_history(org, parent, 10).await.unwrap();
    let auto = history
        .iter()
        .find(|h| h.change_type == "completed")
        .unwrap();
    assert_eq!(auto.agent_id, SYSTEM_AGENT);
}

#[tokio::test]
async fn auto_complete_recurses_through_nested_hierarchies() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let grandparent = make_typed_task(&store, org, project, "Epic", TaskType::Epic).await;
    let parent = make_typed_task(&store, org, project, "Story", TaskType::Abstract).await;
    let c1 = make_task(&store, org, project, "Step 1").await;
    let c2 = make_task(&store, org, project, "Step 2").await;

    store
        .create_relationship(org, grandparent, parent, RelationshipType::Subtask, "s")
        .await
        .unwrap();
    store
        .create_relationship(org, parent, c1, RelationshipType::Subtask, "s")
        .await
        .unwrap();
    store
        .create_relationship(org, parent, c2, RelationshipType::Subtask, "s")
        .await
        .unwrap();

    store.reserve(org, c1, "a1").await.unwrap();
    store.complete(org, c1, "a1", None, None).await.unwrap();
    assert_eq!(
        store
            .get_task(org, grandparent)
            .await
            .unwrap()
            .unwrap()
            .task_status,
        TaskStatus::Available
    );

    store.reserve(org, c2, "a1").await.unwrap();
    store.complete(org, c2, "a1", None, None).await.unwrap();

    assert_eq!(
        store.get_task(org, parent).await.unwrap().unwrap().task_status,
        TaskStatus::Complete
    );
    assert_eq!(
        store
            .get_task(org, grandparent)
            .await
            .unwrap()
            .unwrap()
            .task_status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn auto_complete_never_fires_without_subtask_edges() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let parent = make_typed_task(&store, org, project, "Solo parent", TaskType::Abstract).await;
    let followup = make_task(&store, org, project, "Followup work").await;
    store
        .create_relationship(org, parent, followup, RelationshipType::Followup, "s")
        .await
        .unwrap();

    store.reserve(org, followup, "a1").await.unwrap();
    store
        .complete(org, followup, "a1", None, None)
        .await
        .unwrap();

    let p = store.get_task(org, parent).await.unwrap().unwrap();
    assert_eq!(
        p.task_status,
        TaskStatus::Available,
        "a followup edge is not a subtask edge"
    );
}

#[tokio::test]
async fn blocked_descendant_derives_blocked_on_ancestors() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let parent = make_typed_task(&store, org, project, "Ancestor", TaskType::Abstract).await;
    let child = make_task(&store, org, project, "Child").await;
    let blocker = make_task(&store, org, project, "Blocker").await;

    store
        .create_relationship(org, parent, child, RelationshipType::Subtask, "s")
        .await
        .unwrap();
    // blocked_by persists `blocked` on the child row.
    store
        .create_relationship(org, child, blocker, RelationshipType::BlockedBy, "s")
        .await
        .unwrap();

    let child_row = store.get_task(org, child).await.unwrap().unwrap();
    assert_eq!(child_row.task_status, TaskStatus::Blocked);

    assert!(store.has_blocked_descendant(parent).await.unwrap());
    assert!(!store.has_blocked_descendant(blocker).await.unwrap());

    // A derived-blocked parent is not offered as available breakdown work.
    let available = store
        .available_for_agent(org, AgentType::Breakdown, None, 10)
        .await
        .unwrap();
    assert!(available.iter().all(|t| t.id != parent));
}

// --- Blocking graph ---

#[tokio::test]
async fn blocking_chain_cycle_is_refused() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let a = make_task(&store, org, project, "A").await;
    let b = make_task(&store, org, project, "B").await;
    let c = make_task(&store, org, project, "C").await;

    store
        .create_relationship(org, a, b, RelationshipType::BlockedBy, "s")
        .await
        .unwrap();
    store
        .create_relationship(org, b, c, RelationshipType::BlockedBy, "s")
        .await
        .unwrap();

    let err = store
        .create_relationship(org, c, a, RelationshipType::BlockedBy, "s")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::CircularDependency(_)));

    let edges: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM task_relationships WHERE relationship_type = 'blocked_by'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(edges, 2, "the refused edge must not be inserted");
}

#[tokio::test]
async fn inverse_blocking_edge_is_an_immediate_cycle() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let a = make_task(&store, org, project, "A").await;
    let b = make_task(&store, org, project, "B").await;

    // blocking(a, b): a blocks b.
    store
        .create_relationship(org, a, b, RelationshipType::Blocking, "s")
        .await
        .unwrap();

    // blocked_by(a, b) would mean b blocks a - the inverse.
    let err = store
        .create_relationship(org, a, b, RelationshipType::BlockedBy, "s")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::CircularDependency(_)));

    // Same cycle stated from the other side.
    let err = store
        .create_relationship(org, b, a, RelationshipType::Blocking, "s")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::CircularDependency(_)));
}

#[tokio::test]
async fn relationship_creation_is_idempotent_per_triple() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let parent = make_task(&store, org, project, "P").await;
    let child = make_task(&store, org, project, "C").await;

    let first = store
        .create_relationship(org, parent, child, RelationshipType::Related, "s")
        .await
        .unwrap();
    let second = store
        .create_relationship(org, parent, child, RelationshipType::Related, "s")
        .await
        .unwrap();
    assert_eq!(first, second);

    let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_relationships")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(edges, 1);

    let related = store.related_tasks(org, parent, None).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].child_title, "C");
}

#[tokio::test]
async fn relationship_deletion_records_history() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let parent = make_task(&store, org, project, "P").await;
    let child = make_task(&store, org, project, "C").await;

    store
        .create_relationship(org, parent, child, RelationshipType::Related, "s")
        .await
        .unwrap();
    assert!(store
        .delete_relationship(org, parent, child, RelationshipType::Related, "s")
        .await
        .unwrap());
    assert!(!store
        .delete_relationship(org, parent, child, RelationshipType::Related, "s")
        .await
        .unwrap());

    let history = store.change_history(org, parent, 10).await.unwrap();
    assert!(history
        .iter()
        .any(|h| h.change_type == "relationship_removed"));
    assert!(store.related_tasks(org, parent, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn self_relationships_are_rejected() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task = make_task(&store, org, project, "narcissist").await;
    let err = store
        .create_relationship(org, task, task, RelationshipType::Subtask, "s")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

// --- Reclaimer ---

#[tokio::test]
async fn stale_lease_is_reclaimed_with_finding_and_history() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "slow work").await;
    store.reserve(org, task_id, "a1").await.unwrap();
    age_task(&store, task_id, 25).await;

    let reclaimed = store.reclaim_stale(24, 100).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].task_id, task_id);
    assert_eq!(reclaimed[0].previous_agent, "a1");

    let task = store.get_task(org, task_id).await.unwrap().unwrap();
    assert_eq!(task.task_status, TaskStatus::Available);
    assert!(task.assigned_agent.is_none());

    let updates = store.task_updates(org, task_id, 10).await.unwrap();
    let finding = updates
        .iter()
        .find(|u| u.update_type == UpdateType::Finding)
        .expect("reclaimer must leave a finding update");
    assert_eq!(finding.agent_id, SYSTEM_AGENT);
    assert!(finding.content.contains("unlocked due to timeout"));
    assert!(finding.content.contains("a1"));

    let history = store.change_history(org, task_id, 10).await.unwrap();
    let stale = history
        .iter()
        .find(|h| h.change_type == "unlocked_stale")
        .unwrap();
    assert_eq!(stale.old_value.as_deref(), Some("a1"));

    // The next reservation sees the stale marker.
    store.reserve(org, task_id, "a2").await.unwrap();
    let updates = store.task_updates(org, task_id, 10).await.unwrap();
    let warning = StaleWarning::scan(&updates).expect("stale warning expected");
    assert_eq!(warning.previous_agent, "a1");
}

#[tokio::test]
async fn fresh_leases_are_not_reclaimed() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "active work").await;
    store.reserve(org, task_id, "a1").await.unwrap();
    age_task(&store, task_id, 2).await;

    let reclaimed = store.reclaim_stale(24, 100).await.unwrap();
    assert!(reclaimed.is_empty());

    let task = store.get_task(org, task_id).await.unwrap().unwrap();
    assert_eq!(task.task_status, TaskStatus::InProgress);
}

#[tokio::test]
async fn updates_keep_a_lease_fresh() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "chatty work").await;
    store.reserve(org, task_id, "a1").await.unwrap();
    age_task(&store, task_id, 25).await;

    // An update advances updated_at, which resets the staleness clock.
    store
        .add_update(org, task_id, "a1", UpdateType::Progress, "still on it", None)
        .await
        .unwrap();

    let reclaimed = store.reclaim_stale(24, 100).await.unwrap();
    assert!(reclaimed.is_empty());
}

// --- Tenancy ---

#[tokio::test]
async fn tenant_scope_hides_foreign_rows() {
    let store = test_store().await;
    let (org1, project1) = seed(&store).await;
    let (org2, project2) = seed(&store).await;
    let t1 = make_task(&store, org1, project1, "ours").await;
    let t2 = make_task(&store, org2, project2, "theirs").await;

    assert!(store.get_task(org1, t2).await.unwrap().is_none());
    assert!(store.get_task(org2, t1).await.unwrap().is_none());

    let mine = store.query_tasks(org1, TaskFilter::default()).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, t1);

    // Cross-tenant relationship attempts answer not_found on the foreign id.
    let err = store
        .create_relationship(org1, t1, t2, RelationshipType::Related, "s")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // Lease operations are scoped too.
    let err = store.reserve(org1, t2, "a1").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn api_key_lifecycle() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;

    let issued = store.create_api_key(org, project, "ci-bot").await.unwrap();
    assert!(issued.secret.starts_with("tbk_"));
    assert!(issued.secret.len() > 20);
    assert!(issued.secret.starts_with(&issued.key.key_prefix));

    // The secret resolves; listings never expose it.
    let resolution = store.resolve_api_key(&issued.secret).await.unwrap().unwrap();
    assert_eq!(resolution.organization_id, org);
    assert_eq!(resolution.project_id, project);
    assert!(resolution.enabled);

    let keys = store.list_api_keys(org, project).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key_prefix.len(), 12);

    store.touch_api_key(issued.key.id).await.unwrap();
    let keys = store.list_api_keys(org, project).await.unwrap();
    assert!(keys[0].last_used_at.is_some());

    // Revocation is idempotent.
    assert!(store.revoke_api_key(org, issued.key.id).await.unwrap());
    assert!(!store.revoke_api_key(org, issued.key.id).await.unwrap());
    let resolution = store.resolve_api_key(&issued.secret).await.unwrap().unwrap();
    assert!(!resolution.enabled);
}

#[tokio::test]
async fn memberships_carry_role_permissions() {
    let store = test_store().await;
    let (org, _project) = seed(&store).await;
    let (other_org, _other_project) = seed(&store).await;

    let team = store
        .create_team(org, "platform", Some("platform crew"))
        .await
        .unwrap();
    let reader = store
        .create_role(org, "reader", &["read:*".to_string()])
        .await
        .unwrap();
    let operator = store
        .create_role(
            org,
            "operator",
            &["read:tasks".to_string(), "write:tasks".to_string()],
        )
        .await
        .unwrap();

    store
        .create_membership(org, "casey", Some(team.id), &[reader.id, operator.id])
        .await
        .unwrap();

    let permissions = store.member_permissions(org, "casey").await.unwrap();
    assert_eq!(
        permissions,
        vec![
            "read:*".to_string(),
            "read:tasks".to_string(),
            "write:tasks".to_string()
        ]
    );

    // Roles from another organization never leak in.
    assert!(store
        .member_permissions(other_org, "casey")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn api_key_rotation_disables_the_old_secret() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let old = store.create_api_key(org, project, "rotating").await.unwrap();

    let new = store.rotate_api_key(org, old.key.id).await.unwrap();
    assert_ne!(new.key.id, old.key.id);
    assert_ne!(new.secret, old.secret);
    assert_eq!(new.key.project_id, project);

    let old_resolution = store.resolve_api_key(&old.secret).await.unwrap().unwrap();
    assert!(!old_resolution.enabled);
    let new_resolution = store.resolve_api_key(&new.secret).await.unwrap().unwrap();
    assert!(new_resolution.enabled);
}

// --- Audit: updates, history, versions, feed ---

#[tokio::test]
async fn field_updates_write_history_and_versions() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "versioned").await;

    let patch = TaskPatch {
        title: Some("Renamed".to_string()),
        priority: Some(Priority::High),
        ..Default::default()
    };
    store
        .update_task_fields(org, task_id, patch, "editor")
        .await
        .unwrap();

    let versions = store.task_versions(org, task_id).await.unwrap();
    let numbers: Vec<i64> = versions.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![1, 2], "monotonic version numbers without gaps");
    assert_eq!(versions[1].title, "Renamed");

    let diff = versions[0].diff(&versions[1]);
    assert_eq!(diff.len(), 2);
    assert!(diff.contains_key("title"));
    assert!(diff.contains_key("priority"));

    let history = store.change_history(org, task_id, 50).await.unwrap();
    let fields: Vec<_> = history
        .iter()
        .filter(|h| h.change_type == "field_updated")
        .filter_map(|h| h.field_name.clone())
        .collect();
    assert!(fields.contains(&"title".to_string()));
    assert!(fields.contains(&"priority".to_string()));

    // Non-snapshotted fields don't mint a version.
    let patch = TaskPatch {
        actual_hours: Some(Some(1.0)),
        ..Default::default()
    };
    store
        .update_task_fields(org, task_id, patch, "editor")
        .await
        .unwrap();
    let versions = store.task_versions(org, task_id).await.unwrap();
    assert_eq!(versions.len(), 2);
}

#[tokio::test]
async fn direct_status_writes_are_validated() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "guarded").await;

    // in_progress is entered by reserving, never by a field write.
    let patch = TaskPatch {
        task_status: Some(TaskStatus::InProgress),
        ..Default::default()
    };
    let err = store
        .update_task_fields(org, task_id, patch, "editor")
        .await
        .unwrap_err();
    assert!(err.is_validation());

    // available -> cancelled is legal.
    let patch = TaskPatch {
        task_status: Some(TaskStatus::Cancelled),
        ..Default::default()
    };
    let task = store
        .update_task_fields(org, task_id, patch, "editor")
        .await
        .unwrap();
    assert_eq!(task.task_status, TaskStatus::Cancelled);

    // cancelled is terminal.
    let patch = TaskPatch {
        task_status: Some(TaskStatus::Available),
        ..Default::default()
    };
    let err = store
        .update_task_fields(org, task_id, patch, "editor")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTransition(_, _)));
}

#[tokio::test]
async fn activity_feed_merges_streams_chronologically() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "busy").await;

    store.reserve(org, task_id, "a1").await.unwrap();
    store
        .add_update(org, task_id, "a1", UpdateType::Progress, "halfway", None)
        .await
        .unwrap();
    store
        .complete(org, task_id, "a1", None, None)
        .await
        .unwrap();

    let feed = store
        .activity_feed(org, Default::default())
        .await
        .unwrap();
    assert!(feed.len() >= 3);
    for pair in feed.windows(2) {
        assert!(
            pair[0].created_at <= pair[1].created_at,
            "feed must be oldest-first"
        );
    }
    assert!(feed.iter().any(|e| e.label == "locked"));
    assert!(feed.iter().any(|e| e.label == "progress"));
    assert!(feed.iter().any(|e| e.label == "completed"));

    // Agent filter.
    let feed = store
        .activity_feed(
            org,
            broker_core::models::FeedFilter {
                agent_id: Some("a1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(feed.iter().all(|e| e.agent_id == "a1"));
}

// --- Queries ---

#[tokio::test]
async fn query_orders_by_priority_rank() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;

    for (title, priority) in [
        ("low job", Priority::Low),
        ("critical job", Priority::Critical),
        ("medium job", Priority::Medium),
    ] {
        let mut task = NewTask::new(title, TaskType::Concrete, "i", "v");
        task.project_id = Some(project);
        task.priority = priority;
        store.create_task(org, task, "s").await.unwrap();
    }

    let filter = TaskFilter {
        order_by: TaskOrder::Priority,
        ..Default::default()
    };
    let tasks = store.query_tasks(org, filter).await.unwrap();
    assert_eq!(tasks[0].priority, Priority::Critical);
    assert_eq!(tasks.last().unwrap().priority, Priority::Low);

    let filter = TaskFilter {
        order_by: TaskOrder::PriorityAsc,
        ..Default::default()
    };
    let tasks = store.query_tasks(org, filter).await.unwrap();
    assert_eq!(tasks[0].priority, Priority::Low);
}

#[tokio::test]
async fn search_ranks_by_distinct_token_hits() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;

    let mut both = NewTask::new(
        "Rebuild index pipeline",
        TaskType::Concrete,
        "rebuild the search index",
        "index serves queries",
    );
    both.project_id = Some(project);
    let both_id = store.create_task(org, both, "s").await.unwrap().id;

    let mut one = NewTask::new(
        "Fix pipeline lint",
        TaskType::Concrete,
        "tidy the build",
        "lint passes",
    );
    one.project_id = Some(project);
    store.create_task(org, one, "s").await.unwrap();

    let results = store.search_tasks(org, "index pipeline", 10).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, both_id, "two token hits outrank one");

    // Case-insensitive substring match.
    let results = store.search_tasks(org, "INDEX", 10).await.unwrap();
    assert_eq!(results.len(), 1);

    // Empty query returns everything in scope, up to the limit.
    let results = store.search_tasks(org, "   ", 10).await.unwrap();
    assert_eq!(results.len(), 2);
    let results = store.search_tasks(org, "", 1).await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn statistics_and_deadline_queries() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;

    let mut due_soon = NewTask::new("due soon", TaskType::Concrete, "i", "v");
    due_soon.project_id = Some(project);
    due_soon.due_date = Some(Utc::now() + Duration::hours(3));
    let due_soon_id = store.create_task(org, due_soon, "s").await.unwrap().id;

    let mut overdue = NewTask::new("overdue", TaskType::Concrete, "i", "v");
    overdue.project_id = Some(project);
    overdue.due_date = Some(Utc::now() - Duration::hours(3));
    let overdue_id = store.create_task(org, overdue, "s").await.unwrap().id;

    let done = make_task(&store, org, project, "done").await;
    store.reserve(org, done, "a1").await.unwrap();
    store.complete(org, done, "a1", None, Some(2.0)).await.unwrap();

    let stats = store
        .task_statistics(org, TaskFilter::default())
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status.get("complete"), Some(&1));
    assert_eq!(stats.by_status.get("available"), Some(&2));
    assert_eq!(stats.overdue, 1);
    assert_eq!(stats.avg_actual_hours, Some(2.0));

    let approaching = store.approaching_deadline(org, 12, 10).await.unwrap();
    assert_eq!(approaching.len(), 1);
    assert_eq!(approaching[0].id, due_soon_id);

    let overdue_list = store.overdue_tasks(org, 10).await.unwrap();
    assert_eq!(overdue_list.len(), 1);
    assert_eq!(overdue_list[0].id, overdue_id);

    let completions = store
        .recent_completions(org, Utc::now() - Duration::days(7), 10)
        .await
        .unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].id, done);

    let perf = store.agent_performance(org, "a1", None).await.unwrap();
    assert_eq!(perf.completed, 1);
    assert_eq!(perf.avg_actual_hours, Some(2.0));

    let summaries = store
        .task_summaries(org, TaskFilter::default())
        .await
        .unwrap();
    assert_eq!(summaries.len(), 3);
    assert!(summaries.iter().any(|s| s.title == "overdue"));
}

#[tokio::test]
async fn stale_listing_is_scoped_and_read_only() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let (other_org, other_project) = seed(&store).await;

    let mine = make_task(&store, org, project, "mine").await;
    store.reserve(org, mine, "a1").await.unwrap();
    age_task(&store, mine, 30).await;

    let theirs = make_task(&store, other_org, other_project, "theirs").await;
    store.reserve(other_org, theirs, "b1").await.unwrap();
    age_task(&store, theirs, 30).await;

    let stale = store.stale_tasks(org, 24).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, mine);

    // Listing does not mutate; the lease is still held.
    let task = store.get_task(org, mine).await.unwrap().unwrap();
    assert_eq!(task.task_status, TaskStatus::InProgress);
}

// --- Recurrence ---

#[tokio::test]
async fn recurrence_materializes_and_advances() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let base = make_task(&store, org, project, "Nightly sweep").await;

    let recurrence = store
        .create_recurrence(
            org,
            NewRecurrence {
                base_task_id: base,
                recurrence_type: RecurrenceType::Daily,
                config: RecurrenceConfig::default(),
                next_occurrence: Utc::now() - Duration::minutes(5),
            },
        )
        .await
        .unwrap();

    let due = store.due_recurrences(Utc::now(), 10).await.unwrap();
    assert_eq!(due.len(), 1);

    let fetched = store
        .get_recurrence(org, recurrence.id)
        .await
        .unwrap()
        .unwrap();
    assert!(fetched.is_active);
    assert!(fetched.last_occurrence_created.is_none());

    let (instance, advanced) = store
        .materialize_instance(Some(org), recurrence.id)
        .await
        .unwrap();
    assert_ne!(instance.id, base);
    assert_eq!(instance.title, "Nightly sweep");
    assert_eq!(instance.task_status, TaskStatus::Available);
    assert_eq!(instance.verification_status, VerificationStatus::Unverified);
    assert_eq!(
        advanced.next_occurrence,
        recurrence.next_occurrence + Duration::days(1),
        "advance steps from the scheduled occurrence, not from now"
    );
    assert!(advanced.last_occurrence_created.is_some());

    // Each call clones a fresh instance (deliberately not idempotent).
    let (second, _) = store
        .materialize_instance(Some(org), recurrence.id)
        .await
        .unwrap();
    assert_ne!(second.id, instance.id);

    // Deactivation is idempotent and stops materialization.
    assert!(store.deactivate_recurrence(org, recurrence.id).await.unwrap());
    assert!(!store.deactivate_recurrence(org, recurrence.id).await.unwrap());
    let err = store
        .materialize_instance(Some(org), recurrence.id)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let active = store.list_recurrences(org, true).await.unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn recurrence_updates_validate_the_merged_schedule() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let base = make_task(&store, org, project, "Report").await;
    let recurrence = store
        .create_recurrence(
            org,
            NewRecurrence {
                base_task_id: base,
                recurrence_type: RecurrenceType::Daily,
                config: RecurrenceConfig::default(),
                next_occurrence: Utc::now() + Duration::days(1),
            },
        )
        .await
        .unwrap();

    // Switching to weekly without a weekday is incoherent.
    let err = store
        .update_recurrence(
            org,
            recurrence.id,
            broker_core::models::RecurrencePatch {
                recurrence_type: Some(RecurrenceType::Weekly),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let updated = store
        .update_recurrence(
            org,
            recurrence.id,
            broker_core::models::RecurrencePatch {
                recurrence_type: Some(RecurrenceType::Weekly),
                config: Some(RecurrenceConfig {
                    day_of_week: Some(4),
                    day_of_month: None,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.recurrence_type, RecurrenceType::Weekly);
    assert_eq!(updated.config.day_of_week, Some(4));
}

// --- Tags, templates, comments ---

#[tokio::test]
async fn tag_creation_is_idempotent_by_name() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "tagged").await;

    let first = store.create_tag("backend").await.unwrap();
    let second = store.create_tag("backend").await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(store.list_tags().await.unwrap().len(), 1);

    assert!(store.assign_tag(org, task_id, first.id).await.unwrap());
    assert!(!store.assign_tag(org, task_id, first.id).await.unwrap());

    let tags = store.task_tags(org, task_id).await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "backend");

    assert!(store.remove_tag(org, task_id, first.id).await.unwrap());
    assert!(!store.remove_tag(org, task_id, first.id).await.unwrap());
}

#[tokio::test]
async fn templates_create_and_filter() {
    let store = test_store().await;
    let (org, _project) = seed(&store).await;

    let template = store
        .create_template(
            org,
            NewTemplate {
                name: "Incident review".to_string(),
                description: Some("Post-incident follow-up".to_string()),
                task_type: TaskType::Concrete,
                task_instruction: "Write the timeline".to_string(),
                verification_instruction: "Timeline covers detection to resolution".to_string(),
                priority: Priority::High,
                estimated_hours: Some(2.0),
            },
        )
        .await
        .unwrap();

    let all = store.list_templates(org, None).await.unwrap();
    assert_eq!(all.len(), 1);
    let epics = store.list_templates(org, Some(TaskType::Epic)).await.unwrap();
    assert!(epics.is_empty());

    let fetched = store.get_template(org, template.id).await.unwrap().unwrap();
    assert_eq!(fetched.priority, Priority::High);
}

#[tokio::test]
async fn comment_threads_cascade_on_delete() {
    let store = test_store().await;
    let (org, project) = seed(&store).await;
    let task_id = make_task(&store, org, project, "discussed").await;

    let root = store
        .create_comment(
            org,
            NewComment {
                task_id,
                author_agent: "a1".to_string(),
                parent_comment_id: None,
                content: "How should we shard this?".to_string(),
                mentions: vec!["a2".to_string()],
            },
        )
        .await
        .unwrap();
    let reply = store
        .create_comment(
            org,
            NewComment {
                task_id,
                author_agent: "a2".to_string(),
                parent_comment_id: Some(root.id),
                content: "By tenant, probably.".to_string(),
                mentions: vec![],
            },
        )
        .await
        .unwrap();
    store
        .create_comment(
            org,
            NewComment {
                task_id,
                author_agent: "a1".to_string(),
                parent_comment_id: Some(reply.id),
                content: "Agreed.".to_string(),
                mentions: vec![],
            },
        )
        .await
        .unwrap();

    let thread = store.comment_thread(org, root.id).await.unwrap();
    assert_eq!(thread.len(), 3);

    // Only the author may edit.
    let err = store
        .update_comment(org, root.id, "a2", "hijacked")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Forbidden(_)));

    let removed = store.delete_comment(org, root.id, "a1").await.unwrap();
    assert_eq!(removed, 3, "deleting the root cascades to replies");
    let remaining = store.task_comments(org, task_id, 10).await.unwrap();
    assert!(remaining.is_empty());
}
