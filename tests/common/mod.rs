//! In-process storage nodes speaking the node HTTP surface over shares.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use secretrag::{
    CoordinatorConfig, HashingEmbedder, Initializer, Node, NodeClientSettings, QueryOptions,
    RagCoordinator, SessionOptions, WritePipeline,
};

/// Width of the test embedder.
pub const DIMS: usize = 384;

/// How long a stalled request hangs; longer than any client timeout used in tests.
const STALL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Store {
    schemas: HashMap<String, Value>,
    queries: HashMap<String, StoredQuery>,
    data: HashMap<String, Vec<Value>>,
}

struct StoredQuery {
    schema: String,
    filtered: bool,
}

/// A request the node received.
#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub token: String,
    pub body: Value,
}

#[derive(Clone, Default)]
struct MockState {
    store: Arc<Mutex<Store>>,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_execute: Arc<AtomicBool>,
    omit_data: Arc<AtomicBool>,
    stall_execute: Arc<AtomicUsize>,
    hidden: Arc<Mutex<HashSet<String>>>,
}

type Reply = Result<Json<Value>, (StatusCode, String)>;

/// Handle on one running mock node.
pub struct MockNode {
    pub url: String,
    pub did: String,
    state: MockState,
}

impl MockNode {
    pub async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = MockState::default();
        let app = Router::new()
            .route("/schemas", post(create_schema))
            .route("/queries", post(create_query))
            .route("/queries/execute", post(execute_query))
            .route("/data/create", post(create_data))
            .route("/data/read", post(read_data))
            .route("/data/flush", post(flush_data))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            did: format!("did:mock:{}", addr.port()),
            state,
        }
    }

    /// Records stored under `schema`.
    pub fn records(&self, schema: &str) -> Vec<Value> {
        let store = self.state.store.lock().unwrap();
        store.data.get(schema).cloned().unwrap_or_default()
    }

    pub fn schema_ids(&self) -> HashSet<String> {
        self.state.store.lock().unwrap().schemas.keys().cloned().collect()
    }

    pub fn query_ids(&self) -> HashSet<String> {
        self.state.store.lock().unwrap().queries.keys().cloned().collect()
    }

    /// Requests received on `path`, oldest first.
    pub fn calls(&self, path: &str) -> Vec<Call> {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.path == path)
            .cloned()
            .collect()
    }

    /// Makes `/queries/execute` answer 500.
    pub fn fail_execute(&self, fail: bool) {
        self.state.fail_execute.store(fail, Ordering::SeqCst);
    }

    /// Makes `/queries/execute` answer 200 without a `data` field.
    pub fn omit_data(&self, omit: bool) {
        self.state.omit_data.store(omit, Ordering::SeqCst);
    }

    /// Makes the next `count` calls to `/queries/execute` hang past the client timeout.
    pub fn stall_execute(&self, count: usize) {
        self.state.stall_execute.store(count, Ordering::SeqCst);
    }

    /// Leaves `id` out of subtract-query results on this node.
    pub fn hide(&self, id: &str) {
        self.state.hidden.lock().unwrap().insert(id.to_string());
    }
}

fn record(state: &MockState, path: &str, headers: &HeaderMap, body: &Value) -> Result<(), (StatusCode, String)> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or((StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    state.calls.lock().unwrap().push(Call {
        path: path.to_string(),
        token,
        body: body.clone(),
    });
    Ok(())
}

fn bad(message: &str) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn ints(value: &Value) -> Option<Vec<i64>> {
    value.as_array()?.iter().map(Value::as_i64).collect()
}

async fn create_schema(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    record(&state, "/schemas", &headers, &body)?;
    let id = body["_id"].as_str().ok_or_else(|| bad("schema without _id"))?.to_string();
    let mut store = state.store.lock().unwrap();
    store.schemas.insert(id.clone(), body);
    store.data.entry(id).or_default();
    Ok(Json(json!({})))
}

async fn create_query(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    record(&state, "/queries", &headers, &body)?;
    let id = body["_id"].as_str().ok_or_else(|| bad("query without _id"))?.to_string();
    let schema = body["schema"].as_str().ok_or_else(|| bad("query without schema"))?.to_string();
    let filtered = body["pipeline"]
        .as_array()
        .map(|stages| stages.iter().any(|stage| stage.get("$match").is_some()))
        .unwrap_or(false);
    let mut store = state.store.lock().unwrap();
    if !store.schemas.contains_key(&schema) {
        return Err(bad("unknown schema"));
    }
    store.queries.insert(id, StoredQuery { schema, filtered });
    Ok(Json(json!({})))
}

async fn execute_query(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    record(&state, "/queries/execute", &headers, &body)?;
    let stalled = state
        .stall_execute
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if stalled {
        tokio::time::sleep(STALL).await;
    }
    if state.fail_execute.load(Ordering::SeqCst) {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "injected failure".into()));
    }
    if state.omit_data.load(Ordering::SeqCst) {
        return Ok(Json(json!({"errors": []})));
    }
    let id = body["id"].as_str().ok_or_else(|| bad("missing id"))?;
    let query = ints(&body["variables"]["query_embedding"]).ok_or_else(|| bad("bad query_embedding"))?;
    let labels = ints(&body["variables"]["closest_centroids"]);
    let hidden = state.hidden.lock().unwrap().clone();
    let store = state.store.lock().unwrap();
    let stored = store.queries.get(id).ok_or_else(|| bad("unknown query"))?;
    if stored.filtered && labels.is_none() {
        return Err(bad("missing closest_centroids"));
    }
    let mut rows = Vec::new();
    for doc in store.data.get(&stored.schema).into_iter().flatten() {
        let doc_id = doc["_id"].as_str().unwrap_or_default();
        if hidden.contains(doc_id) {
            continue;
        }
        if stored.filtered {
            let label = doc["cluster_centroid"].as_i64();
            let keep = labels
                .as_ref()
                .is_some_and(|labels| label.is_some_and(|label| labels.contains(&label)));
            if !keep {
                continue;
            }
        }
        let embedding = ints(&doc["embedding"]).ok_or_else(|| bad("stored embedding"))?;
        let difference: Vec<i64> = embedding.iter().zip(&query).map(|(e, q)| e - q).collect();
        rows.push(json!({"_id": doc_id, "difference": difference}));
    }
    Ok(Json(json!({ "data": rows })))
}

async fn create_data(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    record(&state, "/data/create", &headers, &body)?;
    let schema = body["schema"].as_str().ok_or_else(|| bad("missing schema"))?;
    let incoming = body["data"].as_array().ok_or_else(|| bad("missing data"))?;
    let mut store = state.store.lock().unwrap();
    let rows = store.data.get_mut(schema).ok_or_else(|| bad("unknown schema"))?;
    let mut created = Vec::new();
    for doc in incoming {
        let id = doc["_id"].as_str().ok_or_else(|| bad("record without _id"))?;
        rows.retain(|existing| existing["_id"].as_str() != Some(id));
        rows.push(doc.clone());
        created.push(id.to_string());
    }
    Ok(Json(json!({"data": {"created": created, "errors": []}})))
}

async fn read_data(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    record(&state, "/data/read", &headers, &body)?;
    let schema = body["schema"].as_str().ok_or_else(|| bad("missing schema"))?;
    let wanted: Option<HashSet<String>> = body["filter"]["_id"]["$in"].as_array().map(|ids| {
        ids.iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect()
    });
    let store = state.store.lock().unwrap();
    let rows: Vec<Value> = store
        .data
        .get(schema)
        .ok_or_else(|| bad("unknown schema"))?
        .iter()
        .filter(|doc| match &wanted {
            Some(ids) => doc["_id"].as_str().is_some_and(|id| ids.contains(id)),
            None => true,
        })
        .cloned()
        .collect();
    Ok(Json(json!({ "data": rows })))
}

async fn flush_data(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    record(&state, "/data/flush", &headers, &body)?;
    let schema = body["schema"].as_str().ok_or_else(|| bad("missing schema"))?;
    let mut store = state.store.lock().unwrap();
    let rows = store.data.get_mut(schema).ok_or_else(|| bad("unknown schema"))?;
    let deleted = rows.len();
    rows.clear();
    Ok(Json(json!({"data": {"deleted": deleted}})))
}

/// Starts `n` mock nodes.
pub async fn spawn_nodes(n: usize) -> Vec<MockNode> {
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        nodes.push(MockNode::spawn().await);
    }
    nodes
}

/// Config pointing at `nodes`, authenticated with static per-node tokens.
pub fn config_for(nodes: &[MockNode], with_clustering: bool) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::new(
        nodes
            .iter()
            .enumerate()
            .map(|(index, mock)| {
                let mut node = Node::new(mock.url.clone(), mock.did.clone());
                node.bearer_token = Some(format!("token-{index}"));
                node
            })
            .collect(),
    );
    config.with_clustering = with_clustering;
    config
}

/// Session options with a short retry delay.
pub fn fast_options() -> SessionOptions {
    SessionOptions {
        client: NodeClientSettings {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        },
        ..SessionOptions::default()
    }
}

/// Coordinator over `config` with the hashing embedder and a custom batch size.
pub fn coordinator(config: &CoordinatorConfig, batch_size: usize, options: QueryOptions) -> RagCoordinator {
    coordinator_with(config, batch_size, options, &fast_options())
}

/// Same as [`coordinator`] with explicit session options.
pub fn coordinator_with(
    config: &CoordinatorConfig,
    batch_size: usize,
    options: QueryOptions,
    session: &SessionOptions,
) -> RagCoordinator {
    let session = config.build_session(session).unwrap();
    RagCoordinator::from_parts(
        session,
        Initializer::new(config.with_clustering),
        WritePipeline::new(batch_size),
        Arc::new(HashingEmbedder::new(DIMS)),
        options,
    )
}

/// Twenty short documents; the first two are the ones about Asia.
pub fn corpus() -> Vec<String> {
    [
        "Tokyo and Kyoto are famous places in Asia",
        "Bangkok and Hanoi are places in Asia",
        "Paris has the Louvre museum and wide boulevards",
        "Rome preserves the Colosseum and ancient forums",
        "Berlin grew around the river Spree",
        "Madrid hosts the Prado gallery",
        "Lisbon sits on seven hills above the Tagus",
        "Oslo faces a long fjord",
        "Toronto lies beside Lake Ontario",
        "Mexico City was built on a lake bed",
        "Lima overlooks the Pacific Ocean",
        "Buenos Aires dances the tango",
        "Nairobi borders a national park",
        "Cairo stands near the pyramids of Giza",
        "Sydney has an opera house on the harbour",
        "Auckland spreads across volcanic cones",
        "Reykjavik heats homes with geothermal water",
        "Dublin brews dark stout",
        "Vienna waltzes through grand ballrooms",
        "Prague keeps a medieval astronomical clock",
    ]
    .iter()
    .map(|text| text.to_string())
    .collect()
}
