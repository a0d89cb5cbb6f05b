mod common;

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::Ordering;

use common::*;
use oparl_ingestion::{ChangeKind, Config, EntityStore, EntityType, SyncErrorType, SyncMode, SyncStatus};

fn since(raw: &Option<String>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw.as_deref().expect("modified_since sent")).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn first_full_sync_creates_each_entity_once_and_resolves_consultations() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());

    let exec = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::Completed);
    assert_eq!(exec.status.exit_code(), 0);

    let events = h.sink.take();
    let created = |t: EntityType| count(&events, t, ChangeKind::Created);
    assert_eq!(created(EntityType::Body), 1);
    assert_eq!(created(EntityType::Organization), 2);
    assert_eq!(created(EntityType::Meeting), 3);
    assert_eq!(created(EntityType::Paper), 5);
    assert_eq!(created(EntityType::Consultation), 4);
    let core: usize = [
        EntityType::Body,
        EntityType::Organization,
        EntityType::Meeting,
        EntityType::Paper,
        EntityType::Consultation,
    ]
    .into_iter()
    .map(created)
    .sum();
    assert_eq!(core, 15);
    // Agenda items are embedded in meetings and published on their own topic
    assert_eq!(created(EntityType::AgendaItem), 4);
    assert!(events.iter().all(|e| e.kind == ChangeKind::Created));

    for k in 1..=4 {
        let c = h
            .store
            .get_entity(EntityType::Consultation, &server.url(&format!("consultation/{}", k)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.link("paper").unwrap().target_id, server.url(&format!("paper/{}", k)));
        assert!(c.link("meeting").is_some(), "consultation {} has no meeting", k);
        assert_eq!(c.link("agenda_item").unwrap().target_id, server.url(&format!("agendaitem/{}", k)));
    }
    assert_eq!(exec.unresolved_links, 0);
    assert_eq!(exec.type_stats[&EntityType::Paper].created, 5);
    assert_eq!(h.store.count_entities(EntityType::Person).await.unwrap(), 0);
}

#[tokio::test]
async fn agenda_item_links_to_consultation_fetched_later_in_the_cycle() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    h.sync(&server.system_url(), SyncMode::Full).await;

    // Meetings (and their agenda items) are stored before papers carry the consultations
    let item = h
        .store
        .get_entity(EntityType::AgendaItem, &server.url("agendaitem/3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.link("consultation").unwrap().target_id, server.url("consultation/3"));
    assert_eq!(item.link("meeting").unwrap().target_id, server.url("meeting/2"));
    assert!(h.store.list_unresolved_links(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn incremental_rerun_without_remote_changes_is_a_no_op() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    let first = h.sync(&server.system_url(), SyncMode::Full).await;
    let before = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    h.sink.take();
    server.state.clear_requests();

    let second = h.sync(&server.system_url(), SyncMode::Incremental).await;
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.mode, SyncMode::Incremental);
    assert!(h.sink.take().is_empty());
    assert_eq!(second.total(oparl_ingestion::UpsertOutcome::Created), 0);
    assert_eq!(second.total(oparl_ingestion::UpsertOutcome::Updated), 0);

    let after = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(after.last_success.unwrap() > before.last_success.unwrap());

    // Collections are asked only for changes since the previous cycle, minus the overlap
    let papers = server.state.requests_for("papers");
    let sent = since(&papers[0]);
    assert!(sent < first.started_at);
    assert!(sent >= first.started_at - Duration::seconds(301));
}

#[tokio::test]
async fn full_rerun_is_idempotent() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    h.sync(&server.system_url(), SyncMode::Full).await;
    h.sink.take();

    let again = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(again.status, SyncStatus::Completed);
    assert!(h.sink.take().is_empty());
    assert_eq!(h.store.count_entities(EntityType::Paper).await.unwrap(), 5);
    assert_eq!(h.store.count_entities(EntityType::Consultation).await.unwrap(), 4);
    assert!(server.state.requests_for("papers").iter().all(Option::is_none));
}

#[tokio::test]
async fn advanced_modified_timestamp_yields_exactly_one_update() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    h.sync(&server.system_url(), SyncMode::Full).await;
    h.sink.take();

    server
        .state
        .paper_modified
        .lock()
        .unwrap()
        .insert(1, "2024-03-02T08:01:00+01:00".to_string());
    let exec = h.sync(&server.system_url(), SyncMode::Incremental).await;

    let events = h.sink.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Updated);
    assert_eq!(events[0].entity_type, EntityType::Paper);
    assert_eq!(events[0].external_id, server.url("paper/1"));
    assert_eq!(exec.type_stats[&EntityType::Paper].updated, 1);
    assert_eq!(exec.type_stats[&EntityType::Paper].unchanged, 4);
}

#[tokio::test]
async fn failing_meeting_collection_is_partial_and_retried_next_cycle() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    server.state.fail_meetings.store(true, Ordering::SeqCst);

    let exec = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::PartialFailure);
    assert_eq!(exec.status.exit_code(), 2);
    assert_eq!(server.state.meeting_hits.load(Ordering::SeqCst), 3);
    assert!(exec.failed_entity_types.contains(&EntityType::Meeting));
    assert_eq!(exec.failed_entity_types.len(), 1);
    assert!(exec.error_details.iter().any(|e| e.error_type == SyncErrorType::CollectionFetch));
    assert_eq!(h.store.count_entities(EntityType::Meeting).await.unwrap(), 0);
    assert_eq!(h.store.count_entities(EntityType::Paper).await.unwrap(), 5);
    assert_eq!(h.store.count_entities(EntityType::Organization).await.unwrap(), 2);
    assert!(exec.unresolved_links > 0);

    let source = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(source.pending_retry.contains(&EntityType::Meeting));
    assert!(!source.cursors.contains_key(&EntityType::Meeting));
    assert!(source.cursors.contains_key(&EntityType::Paper));

    let report = h.app.status_report(None).await.unwrap();
    assert_eq!(report.sources.len(), 1);
    assert!(report.sources[0].unresolved_link_count > 0);
    assert_eq!(report.sources[0].latest_execution.as_ref().unwrap().status, SyncStatus::PartialFailure);

    // The remote recovers; the next incremental cycle fetches meetings in full
    server.state.fail_meetings.store(false, Ordering::SeqCst);
    server.state.clear_requests();
    let retry = h.sync(&server.system_url(), SyncMode::Incremental).await;
    assert_eq!(retry.status, SyncStatus::Completed);
    assert_eq!(retry.type_stats[&EntityType::Meeting].created, 3);
    assert!(server.state.requests_for("meetings")[0].is_none());
    assert!(server.state.requests_for("papers")[0].is_some());
    assert_eq!(retry.unresolved_links, 0);

    let c1 = h
        .store
        .get_entity(EntityType::Consultation, &server.url("consultation/1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(c1.link("meeting").unwrap().target_id, server.url("meeting/1"));
    assert_eq!(c1.link("agenda_item").unwrap().target_id, server.url("agendaitem/1"));

    let source = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(source.pending_retry.is_empty());
}

#[tokio::test]
async fn unreachable_body_endpoint_fails_the_cycle() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    let url = server.url("gone");

    let exec = h.sync(&url, SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::Failed);
    assert_eq!(exec.status.exit_code(), 1);
    assert_eq!(exec.error_details[0].error_type, SyncErrorType::BodyFetch);
    assert!(h.sink.take().is_empty());

    let source = h.app.engine.registry().get(&url).await.unwrap().unwrap();
    assert_eq!(source.last_status, Some(SyncStatus::Failed));
    assert!(source.last_success.is_none());
    assert!(source.cursors.is_empty());
}

#[tokio::test]
async fn first_incremental_request_runs_as_full_sync() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    let exec = h.sync(&server.system_url(), SyncMode::Incremental).await;
    assert_eq!(exec.mode, SyncMode::Full);
    assert!(server.state.requests_for("papers").iter().all(Option::is_none));
    assert_eq!(h.store.count_entities(EntityType::Paper).await.unwrap(), 5);
}

#[tokio::test]
async fn every_enabled_source_is_synced_and_executions_are_logged() {
    let server = start_oparl().await;
    let h = Harness::new(test_config());
    h.app.register_sources(Some(&server.system_url())).await.unwrap();

    let executions = h
        .app
        .engine
        .sync_all(SyncMode::Full, &tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].source_id, server.system_url());

    let logged = h.store.latest_sync_executions(Some(&server.system_url()), 5).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].status, SyncStatus::Completed);
    assert!(logged[0].metrics["http"]["requests"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn body_that_cannot_be_stored_fails_the_cycle() {
    let server = start_oparl().await;
    let (h, faults) = Harness::with_faults(test_config());
    faults.fail_body(server.url("body/1"));

    let exec = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::Failed);
    assert_eq!(exec.status.exit_code(), 1);
    assert!(exec.error_details.iter().any(|e| e.entity_type == Some(EntityType::Body)));
    assert!(server.state.requests_for("papers").is_empty());
    assert_eq!(h.store.count_entities(EntityType::Paper).await.unwrap(), 0);

    let source = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(source.last_success.is_none());
    assert!(source.cursors.is_empty());
}

#[tokio::test]
async fn lost_body_keeps_every_cursor_and_is_fetched_in_full_next_cycle() {
    let server = start_oparl().await;
    server.state.second_body.store(true, Ordering::SeqCst);
    let (h, faults) = Harness::with_faults(test_config());
    faults.fail_body(server.url("body/2"));

    let exec = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::PartialFailure);
    assert_eq!(exec.status.exit_code(), 2);
    assert!(exec.failed_entity_types.contains(&EntityType::Body));
    assert_eq!(h.store.count_entities(EntityType::Body).await.unwrap(), 1);
    assert_eq!(h.store.count_entities(EntityType::Paper).await.unwrap(), 5);
    assert!(h.store.get_entity(EntityType::Organization, &server.url("organization/20")).await.unwrap().is_none());

    let source = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(source.cursors.is_empty());
    assert!(source.pending_retry.contains(&EntityType::Body));

    faults.heal();
    server.state.clear_requests();
    let retry = h.sync(&server.system_url(), SyncMode::Incremental).await;
    assert_eq!(retry.mode, SyncMode::Incremental);
    assert_eq!(retry.status, SyncStatus::Completed);
    assert!(server.state.requests_for("papers").iter().all(Option::is_none));
    assert!(h.store.get_entity(EntityType::Organization, &server.url("organization/20")).await.unwrap().is_some());
    let source = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(source.cursors.contains_key(&EntityType::Paper));
}

#[tokio::test]
async fn outbox_failure_leaves_the_entity_unwritten_until_the_next_cycle() {
    let server = start_oparl().await;
    let (h, faults) = Harness::with_faults(test_config());
    let paper = server.url("paper/2");
    faults.fail_event_for(paper.clone());

    let exec = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::PartialFailure);
    assert_eq!(exec.failed_entity_types.iter().copied().collect::<Vec<_>>(), vec![EntityType::Paper]);
    assert_eq!(exec.type_stats[&EntityType::Paper].failed, 1);
    assert!(h.store.get_entity(EntityType::Paper, &paper).await.unwrap().is_none());
    assert!(h.sink.take().iter().all(|e| e.external_id != paper));
    assert!(h.store.pending_events(10).await.unwrap().is_empty());

    let source = h.app.engine.registry().get(&server.system_url()).await.unwrap().unwrap();
    assert!(!source.cursors.contains_key(&EntityType::Paper));
    assert!(source.cursors.contains_key(&EntityType::Meeting));

    faults.heal();
    server.state.clear_requests();
    let retry = h.sync(&server.system_url(), SyncMode::Incremental).await;
    assert_eq!(retry.status, SyncStatus::Completed);
    assert!(server.state.requests_for("papers")[0].is_none());
    let events = h.sink.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].external_id, paper);
    assert_eq!(events[0].kind, ChangeKind::Created);
    let consultation = h
        .store
        .get_entity(EntityType::Consultation, &server.url("consultation/2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consultation.link("paper").unwrap().target_id, paper);
}

#[tokio::test]
async fn memberships_link_only_within_their_body() {
    let server = start_oparl().await;
    server.state.serve_people.store(true, Ordering::SeqCst);
    server.state.second_body.store(true, Ordering::SeqCst);
    let h = Harness::new(test_config());

    let exec = h.sync(&server.system_url(), SyncMode::Full).await;
    assert_eq!(exec.status, SyncStatus::Completed);
    assert_eq!(h.store.count_entities(EntityType::Person).await.unwrap(), 2);
    assert_eq!(h.store.count_entities(EntityType::Membership).await.unwrap(), 4);

    let membership = |n: usize| {
        let store = h.store.clone();
        let id = server.url(&format!("membership/{}", n));
        async move { store.get_entity(EntityType::Membership, &id).await.unwrap().unwrap() }
    };

    let resolved = membership(1).await;
    assert_eq!(resolved.link("organization").unwrap().target_id, server.url("organization/1"));
    assert_eq!(resolved.link("person").unwrap().target_id, server.url("person/1"));

    // organization/99 is never served
    let dangling = membership(2).await;
    assert!(dangling.link("organization").is_none());
    assert_eq!(exec.unresolved_links, 1);
    let unresolved = h.store.list_unresolved_links(Some(&server.system_url())).await.unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].source_external_id, server.url("membership/2"));
    assert_eq!(unresolved[0].target_id, server.url("organization/99"));

    // organization/20 belongs to body/2: stored later in the cycle, still never linked
    let later_foreign = membership(3).await;
    assert!(later_foreign.link("organization").is_none());
    assert!(later_foreign.link("person").is_some());

    // body/2's membership points at an organization body/1 already stored
    let earlier_foreign = membership(20).await;
    assert!(earlier_foreign.link("organization").is_none());
    assert_eq!(earlier_foreign.link("person").unwrap().target_id, server.url("person/20"));

    assert_eq!(exec.metrics["links"]["rejected"], 2);
}

#[tokio::test]
async fn single_source_slot_runs_sources_one_after_another() {
    let server = start_oparl().await;
    let h = Harness::new(Config { source_concurrency: 1, ..test_config() });
    h.app.register_sources(Some(&server.system_url())).await.unwrap();
    h.app.register_sources(Some(&server.url("bodies"))).await.unwrap();

    let mut executions = h
        .app
        .engine
        .sync_all(SyncMode::Full, &tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executions.len(), 2);
    executions.sort_by_key(|e| e.started_at);
    assert!(executions[0].completed_at.unwrap() <= executions[1].started_at);
    assert!(executions.iter().all(|e| e.status == SyncStatus::Completed));
}
