#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use oparl_ingestion::config::StoreBackend;
use oparl_ingestion::events::EventSink;
use oparl_ingestion::{
    ChangeEvent, ChangeKind, Config, DeferredLink, EntityLink, EntityStore, EntityType, ExtractionState, FileExtraction,
    IngestionApp, IngestionError, MemoryStore, Source, StoredEntity, SyncExecution, SyncMode,
};

const TYPE_PREFIX: &str = "https://schema.oparl.org/1.1/";

/// In-process OParl server: one Body with 2 organizations, 3 meetings (4 embedded
/// agenda items) and 5 papers (4 embedded consultations).
///
/// People are only served when `serve_people` is set: person/1 holds memberships in
/// organization/1, in the missing organization/99 and in organization/20 of body/2.
/// `second_body` adds body/2 with organization/20 and, with people, person/20 whose
/// membership points back at organization/1.
pub struct MockOparl {
    pub base: String,
    pub state: Arc<MockState>,
}

#[derive(Default)]
pub struct MockState {
    base: String,
    pub fail_meetings: AtomicBool,
    pub serve_people: AtomicBool,
    pub second_body: AtomicBool,
    pub meeting_hits: AtomicUsize,
    /// Paper number -> overriding `modified` value.
    pub paper_modified: Mutex<HashMap<usize, String>>,
    /// (collection, modified_since) of every collection request.
    pub requests: Mutex<Vec<(String, Option<String>)>>,
}

impl MockState {
    fn record(&self, collection: &str, q: &HashMap<String, String>) {
        self.requests
            .lock()
            .unwrap()
            .push((collection.to_string(), q.get("modified_since").cloned()));
    }

    pub fn requests_for(&self, collection: &str) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, since)| since.clone())
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/oparl/{}", self.base, path)
    }

    fn body(&self, n: usize) -> Value {
        let name = if n == 1 { "Stadt Beispielstadt" } else { "Kreis Musterland" };
        json!({
            "id": self.url(&format!("body/{}", n)),
            "type": format!("{}Body", TYPE_PREFIX),
            "name": name,
            "organization": self.url(&format!("body/{}/organizations", n)),
            "person": self.url(&format!("body/{}/people", n)),
            "meeting": self.url(&format!("body/{}/meetings", n)),
            "paper": self.url(&format!("body/{}/papers", n)),
            "created": "2023-01-01T00:00:00+01:00",
            "modified": "2024-01-01T00:00:00+01:00"
        })
    }

    fn person(&self, n: usize, organizations: &[usize]) -> Value {
        let memberships: Vec<Value> = organizations
            .iter()
            .enumerate()
            .map(|(i, org)| {
                json!({
                    "id": self.url(&format!("membership/{}", n + i)),
                    "type": format!("{}Membership", TYPE_PREFIX),
                    "organization": self.url(&format!("organization/{}", org)),
                    "role": "Mitglied",
                    "votingRight": true,
                    "modified": "2024-02-01T09:00:00+01:00"
                })
            })
            .collect();
        json!({
            "id": self.url(&format!("person/{}", n)),
            "type": format!("{}Person", TYPE_PREFIX),
            "name": format!("Ratsmitglied {}", n),
            "membership": memberships,
            "modified": "2024-02-01T09:00:00+01:00"
        })
    }

    fn organizations(&self) -> Vec<Value> {
        (1..=2)
            .map(|i| {
                json!({
                    "id": self.url(&format!("organization/{}", i)),
                    "type": format!("{}Organization", TYPE_PREFIX),
                    "name": format!("Ausschuss {}", i),
                    "modified": "2024-02-01T09:00:00+01:00"
                })
            })
            .collect()
    }

    fn meetings(&self) -> Vec<Value> {
        // meeting -> its agenda item numbers
        let agenda: [(usize, &[usize]); 3] = [(1, &[1, 2]), (2, &[3]), (3, &[4])];
        agenda
            .iter()
            .map(|(m, items)| {
                let agenda_items: Vec<Value> = items
                    .iter()
                    .map(|a| {
                        json!({
                            "id": self.url(&format!("agendaitem/{}", a)),
                            "type": format!("{}AgendaItem", TYPE_PREFIX),
                            "number": a.to_string(),
                            "order": a,
                            "name": format!("TOP {}", a),
                            "consultation": self.url(&format!("consultation/{}", a)),
                            "modified": "2024-03-01T12:00:00+01:00"
                        })
                    })
                    .collect();
                json!({
                    "id": self.url(&format!("meeting/{}", m)),
                    "type": format!("{}Meeting", TYPE_PREFIX),
                    "name": format!("Sitzung {}", m),
                    "start": "2024-03-05T17:00:00+01:00",
                    "organization": [self.url("organization/1")],
                    "agendaItem": agenda_items,
                    "modified": "2024-03-01T12:00:00+01:00"
                })
            })
            .collect()
    }

    fn papers(&self) -> Vec<Value> {
        // consultation k belongs to paper k and is held in meeting m under agenda item k
        let meeting_of = |k: usize| match k {
            1 | 2 => 1,
            3 => 2,
            _ => 3,
        };
        let overrides = self.paper_modified.lock().unwrap().clone();
        (1..=5)
            .map(|p| {
                let consultations: Vec<Value> = if p <= 4 {
                    vec![json!({
                        "id": self.url(&format!("consultation/{}", p)),
                        "type": format!("{}Consultation", TYPE_PREFIX),
                        "paper": self.url(&format!("paper/{}", p)),
                        "meeting": self.url(&format!("meeting/{}", meeting_of(p))),
                        "agendaItem": self.url(&format!("agendaitem/{}", p)),
                        "organization": [self.url("organization/1")],
                        "authoritative": true,
                        "modified": "2024-03-02T08:00:00+01:00"
                    })]
                } else {
                    vec![]
                };
                json!({
                    "id": self.url(&format!("paper/{}", p)),
                    "type": format!("{}Paper", TYPE_PREFIX),
                    "name": format!("Vorlage {}", p),
                    "reference": format!("V/2024/{:03}", p),
                    "date": "2024-02-20",
                    "consultation": consultations,
                    "modified": overrides.get(&p).cloned().unwrap_or_else(|| "2024-03-02T08:00:00+01:00".to_string())
                })
            })
            .collect()
    }
}

fn page(state: &MockState, collection: &str, items: Vec<Value>, q: &HashMap<String, String>, per_page: usize) -> Json<Value> {
    let number: usize = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let start = (number - 1) * per_page;
    let data: Vec<Value> = items.iter().skip(start).take(per_page).cloned().collect();
    let mut links = json!({});
    if start + per_page < items.len() {
        links["next"] = json!(format!("{}?page={}", state.url(&format!("body/1/{}", collection)), number + 1));
    }
    Json(json!({ "data": data, "links": links }))
}

async fn system(State(s): State<Arc<MockState>>) -> Json<Value> {
    Json(json!({
        "id": s.url("system"),
        "type": format!("{}System", TYPE_PREFIX),
        "oparlVersion": "https://schema.oparl.org/1.1/",
        "body": s.url("bodies")
    }))
}

async fn bodies(State(s): State<Arc<MockState>>) -> Json<Value> {
    let mut data = vec![s.body(1)];
    if s.second_body.load(Ordering::SeqCst) {
        data.push(s.body(2));
    }
    Json(json!({ "data": data, "links": {} }))
}

async fn organizations(State(s): State<Arc<MockState>>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    s.record("organizations", &q);
    page(&s, "organizations", s.organizations(), &q, 10)
}

async fn people(State(s): State<Arc<MockState>>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    s.record("people", &q);
    let people = if s.serve_people.load(Ordering::SeqCst) { vec![s.person(1, &[1, 99, 20])] } else { vec![] };
    page(&s, "people", people, &q, 10)
}

async fn second_organizations(State(s): State<Arc<MockState>>) -> Json<Value> {
    Json(json!({
        "data": [{
            "id": s.url("organization/20"),
            "type": format!("{}Organization", TYPE_PREFIX),
            "name": "Kreistag",
            "modified": "2024-02-01T09:00:00+01:00"
        }],
        "links": {}
    }))
}

async fn second_people(State(s): State<Arc<MockState>>) -> Json<Value> {
    let people = if s.serve_people.load(Ordering::SeqCst) { vec![s.person(20, &[1])] } else { vec![] };
    Json(json!({ "data": people, "links": {} }))
}

async fn empty_list() -> Json<Value> {
    Json(json!({ "data": [], "links": {} }))
}

async fn meetings(State(s): State<Arc<MockState>>, Query(q): Query<HashMap<String, String>>) -> Response {
    s.record("meetings", &q);
    s.meeting_hits.fetch_add(1, Ordering::SeqCst);
    if s.fail_meetings.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable").into_response();
    }
    page(&s, "meetings", s.meetings(), &q, 2).into_response()
}

async fn papers(State(s): State<Arc<MockState>>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    s.record("papers", &q);
    page(&s, "papers", s.papers(), &q, 3)
}

pub async fn start_oparl() -> MockOparl {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state = Arc::new(MockState { base: base.clone(), ..Default::default() });

    let app = Router::new()
        .route("/oparl/system", get(system))
        .route("/oparl/bodies", get(bodies))
        .route("/oparl/body/1/organizations", get(organizations))
        .route("/oparl/body/1/people", get(people))
        .route("/oparl/body/1/meetings", get(meetings))
        .route("/oparl/body/1/papers", get(papers))
        .route("/oparl/body/2/organizations", get(second_organizations))
        .route("/oparl/body/2/people", get(second_people))
        .route("/oparl/body/2/meetings", get(empty_list))
        .route("/oparl/body/2/papers", get(empty_list))
        .with_state(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    MockOparl { base, state }
}

impl MockOparl {
    pub fn system_url(&self) -> String {
        self.state.url("system")
    }

    pub fn url(&self, path: &str) -> String {
        self.state.url(path)
    }
}

/// Records every event it is handed.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ChangeEvent>>,
}

impl CollectingSink {
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn publish(&self, event: &ChangeEvent) -> oparl_ingestion::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub fn count(events: &[ChangeEvent], entity_type: EntityType, kind: ChangeKind) -> usize {
    events.iter().filter(|e| e.entity_type == entity_type && e.kind == kind).count()
}

pub fn test_config() -> Config {
    Config {
        store_backend: StoreBackend::Memory,
        http_timeout_ms: 5_000,
        http_retry_backoff_ms: 1,
        http_max_backoff_ms: 5,
        breaker_failure_threshold: 50,
        breaker_cooldown_ms: 50,
        worker_concurrency: 4,
        sources_file: "/nonexistent/oparl-sources".to_string(),
        ..Config::default()
    }
}

pub struct Harness {
    pub app: IngestionApp,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<CollectingSink>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::default());
        let app = IngestionApp::assemble(config, store.clone(), vec![sink.clone() as Arc<dyn EventSink>]).unwrap();
        Self { app, store, sink }
    }

    /// Harness whose app writes through a [`FaultyStore`]; `store` is the store behind it.
    pub fn with_faults(config: Config) -> (Self, Arc<FaultyStore>) {
        let faulty = Arc::new(FaultyStore::new());
        let sink = Arc::new(CollectingSink::default());
        let app = IngestionApp::assemble(config, faulty.clone(), vec![sink.clone() as Arc<dyn EventSink>]).unwrap();
        (Self { app, store: faulty.inner.clone(), sink }, faulty)
    }

    pub async fn sync(&self, url: &str, mode: SyncMode) -> SyncExecution {
        self.app.engine.execute_sync(url, mode, &CancellationToken::new()).await.unwrap()
    }
}

/// Memory store that rejects chosen writes.
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    /// Body ids whose entity writes fail.
    pub failing_bodies: Mutex<HashSet<String>>,
    /// Entity ids whose outbox writes fail.
    pub failing_events: Mutex<HashSet<String>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStore::new()),
            failing_bodies: Mutex::new(HashSet::new()),
            failing_events: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_body(&self, id: String) {
        self.failing_bodies.lock().unwrap().insert(id);
    }

    pub fn fail_event_for(&self, id: String) {
        self.failing_events.lock().unwrap().insert(id);
    }

    pub fn heal(&self) {
        self.failing_bodies.lock().unwrap().clear();
        self.failing_events.lock().unwrap().clear();
    }
}

fn disk_full() -> IngestionError {
    IngestionError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
}

#[async_trait]
impl EntityStore for FaultyStore {
    async fn get_entity(&self, entity_type: EntityType, external_id: &str) -> oparl_ingestion::Result<Option<StoredEntity>> {
        self.inner.get_entity(entity_type, external_id).await
    }

    async fn put_entity(&self, entity: &StoredEntity) -> oparl_ingestion::Result<()> {
        if entity.entity_type == EntityType::Body && self.failing_bodies.lock().unwrap().contains(&entity.external_id) {
            return Err(disk_full());
        }
        self.inner.put_entity(entity).await
    }

    async fn set_link(&self, entity_type: EntityType, external_id: &str, link: &EntityLink) -> oparl_ingestion::Result<bool> {
        self.inner.set_link(entity_type, external_id, link).await
    }

    async fn count_entities(&self, entity_type: EntityType) -> oparl_ingestion::Result<u64> {
        self.inner.count_entities(entity_type).await
    }

    async fn list_entities(&self, entity_type: EntityType, limit: usize) -> oparl_ingestion::Result<Vec<StoredEntity>> {
        self.inner.list_entities(entity_type, limit).await
    }

    async fn get_source(&self, id: &str) -> oparl_ingestion::Result<Option<Source>> {
        self.inner.get_source(id).await
    }

    async fn put_source(&self, source: &Source) -> oparl_ingestion::Result<()> {
        self.inner.put_source(source).await
    }

    async fn list_sources(&self) -> oparl_ingestion::Result<Vec<Source>> {
        self.inner.list_sources().await
    }

    async fn insert_sync_execution(&self, execution: &SyncExecution) -> oparl_ingestion::Result<()> {
        self.inner.insert_sync_execution(execution).await
    }

    async fn latest_sync_executions(&self, source_id: Option<&str>, limit: usize) -> oparl_ingestion::Result<Vec<SyncExecution>> {
        self.inner.latest_sync_executions(source_id, limit).await
    }

    async fn replace_unresolved_links(&self, source_id: &str, links: &[DeferredLink]) -> oparl_ingestion::Result<()> {
        self.inner.replace_unresolved_links(source_id, links).await
    }

    async fn list_unresolved_links(&self, source_id: Option<&str>) -> oparl_ingestion::Result<Vec<DeferredLink>> {
        self.inner.list_unresolved_links(source_id).await
    }

    async fn enqueue_event(&self, event: &ChangeEvent) -> oparl_ingestion::Result<()> {
        if self.failing_events.lock().unwrap().contains(&event.external_id) {
            return Err(disk_full());
        }
        self.inner.enqueue_event(event).await
    }

    async fn ack_event(&self, event_id: &str) -> oparl_ingestion::Result<()> {
        self.inner.ack_event(event_id).await
    }

    async fn pending_events(&self, limit: usize) -> oparl_ingestion::Result<Vec<ChangeEvent>> {
        self.inner.pending_events(limit).await
    }

    async fn get_extraction(&self, file_id: &str) -> oparl_ingestion::Result<Option<FileExtraction>> {
        self.inner.get_extraction(file_id).await
    }

    async fn put_extraction(&self, extraction: &FileExtraction) -> oparl_ingestion::Result<()> {
        self.inner.put_extraction(extraction).await
    }

    async fn list_extractions(&self, state: Option<ExtractionState>, limit: usize) -> oparl_ingestion::Result<Vec<FileExtraction>> {
        self.inner.list_extractions(state, limit).await
    }

    async fn count_extractions(&self, state: Option<ExtractionState>) -> oparl_ingestion::Result<u64> {
        self.inner.count_extractions(state).await
    }
}
