//! Concurrency tests against a file-backed database.
//!
//! Every test runs on a multi-threaded runtime with several distinct users
//! writing at once, so SQLite's single-writer rule is actually exercised.

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::task::JoinSet;

use reliefnet::api::AppState;
use reliefnet::assignment::AssignmentEngine;
use reliefnet::config::Config;
use reliefnet::error::{AppError, AppResult};
use reliefnet::geo::GeoPoint;
use reliefnet::model::{Identity, IncidentDraft, Role};
use reliefnet::realtime::ServerEvent;
use reliefnet::storage::Storage;

/// Storage on a fresh database file. Keep the directory alive for the test.
async fn file_storage() -> (TempDir, Storage) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("reliefnet.db").display());
    let storage = Storage::new(&url).await.unwrap();
    (dir, storage)
}

async fn users(storage: &Storage, prefix: &str, role: Role, count: usize) -> Vec<Identity> {
    let mut out = Vec::with_capacity(count);
    for n in 0..count {
        let name = format!("{prefix}{n}");
        let profile = storage
            .create_user(&name, role, &format!("{name}-token"))
            .await
            .unwrap();
        out.push(profile.identity());
    }
    out
}

async fn report(engine: &AssignmentEngine, victim: &Identity, title: &str) -> String {
    engine
        .report_incident(&IncidentDraft {
            title: title.to_string(),
            description: format!("{title} reported"),
            location: GeoPoint::new(77.0, 12.0).unwrap(),
            creator_id: victim.id.clone(),
        })
        .await
        .unwrap()
        .id
}

/// Fail on anything other than success or a rule rejection.
fn expect_no_storage_error<T>(result: &AppResult<T>) {
    if let Err(e) = result {
        assert!(!matches!(e, AppError::Storage(_)), "storage error: {e}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_volunteers_assign_concurrently() {
    let (_dir, storage) = file_storage().await;
    let engine = AssignmentEngine::new(storage.clone());
    let victim = users(&storage, "victim", Role::Victim, 1).await.remove(0);
    let volunteers = users(&storage, "vol", Role::Volunteer, 6).await;

    let mut incidents = Vec::new();
    for n in 0..3 {
        incidents.push(report(&engine, &victim, &format!("Incident {n}")).await);
    }

    let mut tasks = JoinSet::new();
    for volunteer in &volunteers {
        for incident_id in &incidents {
            let engine = engine.clone();
            let volunteer = volunteer.clone();
            let incident_id = incident_id.clone();
            tasks.spawn(async move {
                let result = engine.assign_volunteer(&incident_id, &volunteer).await;
                (volunteer.id, result)
            });
        }
    }

    let mut wins = HashMap::<String, usize>::new();
    while let Some(joined) = tasks.join_next().await {
        let (volunteer_id, result) = joined.unwrap();
        expect_no_storage_error(&result);
        match result {
            Ok(_) => *wins.entry(volunteer_id).or_default() += 1,
            Err(e) => assert!(matches!(e, AppError::Conflict(_)), "{e}"),
        }
    }

    assert_eq!(wins.len(), volunteers.len());
    assert!(wins.values().all(|&n| n == 1), "{wins:?}");
    assert!(engine.audit().await.unwrap().is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resolve_races_assignment() {
    let (_dir, storage) = file_storage().await;
    let engine = AssignmentEngine::new(storage.clone());
    let victims = users(&storage, "victim", Role::Victim, 8).await;
    let leaving = users(&storage, "leaving", Role::Volunteer, 8).await;
    let arriving = users(&storage, "arriving", Role::Volunteer, 8).await;

    for round in 0..8 {
        let victim = victims[round].clone();
        let first = leaving[round].clone();
        let second = arriving[round].clone();
        let incident_id = report(&engine, &victim, &format!("Round {round}")).await;
        engine.assign_volunteer(&incident_id, &first).await.unwrap();

        let leave_victim = {
            let (engine, incident_id) = (engine.clone(), incident_id.clone());
            tokio::spawn(async move { engine.resolve_for(&incident_id, &victim, None).await })
        };
        let leave_volunteer = {
            let (engine, incident_id) = (engine.clone(), incident_id.clone());
            tokio::spawn(async move { engine.resolve_for(&incident_id, &first, None).await })
        };
        let join = {
            let (engine, incident_id) = (engine.clone(), incident_id.clone());
            let second = second.clone();
            tokio::spawn(async move { engine.assign_volunteer(&incident_id, &second).await })
        };

        let left_victim = leave_victim.await.unwrap();
        let left_volunteer = leave_volunteer.await.unwrap();
        let joined = join.await.unwrap();
        expect_no_storage_error(&left_victim);
        expect_no_storage_error(&left_volunteer);
        expect_no_storage_error(&joined);
        assert!(left_victim.is_ok());
        assert!(left_volunteer.is_ok());

        let incident = storage.get_incident(&incident_id).await.unwrap();
        match joined {
            // Arrived before the incident emptied out: it stays open with them.
            Ok(_) => {
                assert!(!incident.status.is_resolved());
                assert_eq!(incident.volunteers, vec![second.id.clone()]);
            }
            Err(e) => {
                assert!(matches!(e, AppError::Conflict(_)), "{e}");
                assert!(incident.status.is_resolved());
            }
        }

        let audit = engine.audit().await.unwrap();
        assert!(audit.is_consistent(), "round {round}: {audit:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chat_from_many_members() {
    let (_dir, storage) = file_storage().await;
    let state = AppState::new(storage.clone(), Config::in_memory());
    let victims = users(&storage, "victim", Role::Victim, 2).await;
    let volunteers = users(&storage, "vol", Role::Volunteer, 2).await;

    let incident_id = report(&state.engine, &victims[0], "Flood").await;
    state.engine.add_victim(&incident_id, &victims[1].id).await.unwrap();
    for volunteer in &volunteers {
        state.engine.assign_volunteer(&incident_id, volunteer).await.unwrap();
    }

    let (listener, mut rx) = state.dispatcher.connect(victims[0].clone()).await;
    state.dispatcher.rooms().join(listener, &incident_id).await;

    let members: Arc<Vec<Identity>> = Arc::new(victims.into_iter().chain(volunteers).collect());
    let mut tasks = JoinSet::new();
    for n in 0..40 {
        let dispatcher = state.dispatcher.clone();
        let members = Arc::clone(&members);
        let incident_id = incident_id.clone();
        tasks.spawn(async move {
            let author = &members[n % members.len()];
            dispatcher
                .post_message(&incident_id, author, &format!("update {n}"))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap();
        expect_no_storage_error(&result);
        assert!(result.is_ok());
    }

    let stored: Vec<String> = storage
        .list_chat_messages(&incident_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServerEvent::NewMessage(message) = event {
            received.push(message.id);
        }
    }

    assert_eq!(stored.len(), 40);
    assert_eq!(received, stored);
    assert!(state.engine.audit().await.unwrap().is_consistent());
}
