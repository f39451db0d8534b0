//! In-memory Kubernetes API server for reconcile tests
//!
//! Backs a `kube::Client` with a `tower_test` mock service. Objects live as
//! JSON keyed by their URL path. Writes follow the API server closely enough
//! for the controller: creates conflict on existing names, merge and apply
//! patches are merged into the stored object, and the resourceVersion only
//! moves when the stored object changes.
//!
//! ```rust,ignore
//! let server = FakeApiServer::new().with_ready_statefulsets();
//! server.insert(&pgbouncer);
//! let client = server.client();
//! ```

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_test::mock;

/// Namespace the client defaults to
pub const TEST_NAMESPACE: &str = "demo";

/// A request as the server saw it
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

impl RecordedRequest {
    pub fn is_event(&self) -> bool {
        self.path.contains("/events")
    }

    pub fn is_status_write(&self) -> bool {
        self.method == Method::PATCH && self.path.ends_with("/status")
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    requests: Vec<RecordedRequest>,
    failures: Vec<(Method, String, StatusCode)>,
    last_version: u64,
    ready_statefulsets: bool,
}

#[derive(Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<State>>,
}

/// URL path of a named object
pub fn object_path<K>(namespace: Option<&str>, name: &str) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!("{}/{}", K::url_path(&(), namespace), name)
}

impl FakeApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every StatefulSet as fully rolled out as soon as it is written
    pub fn with_ready_statefulsets(self) -> Self {
        self.state.lock().unwrap().ready_statefulsets = true;
        self
    }

    /// A client whose requests are served by this server
    pub fn client(&self) -> Client {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let server = self.clone();
        tokio::spawn(async move {
            let mut handle = pin!(handle);
            while let Some((request, send)) = handle.next_request().await {
                send.send_response(server.serve(request).await);
            }
        });
        Client::new(service, TEST_NAMESPACE)
    }

    /// Seed an object as if it had been created earlier
    pub fn insert<K>(&self, object: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let meta = object.meta();
        let key = object_path::<K>(meta.namespace.as_deref(), meta.name.as_deref().unwrap());
        let value = serde_json::to_value(object).unwrap();
        self.state.lock().unwrap().commit(&key, value, None);
    }

    pub fn get<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = object_path::<K>(namespace, name);
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// Answer `method` on `path` with an error status from now on
    pub fn fail(&self, method: Method, path: &str, status: StatusCode) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((method, path.to_string(), status));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// resourceVersion of every stored object except events
    pub fn resource_versions(&self) -> BTreeMap<String, String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|(key, _)| !key.contains("/events/"))
            .map(|(key, value)| {
                let version = value["metadata"]["resourceVersion"].as_str().unwrap_or_default();
                (key.clone(), version.to_string())
            })
            .collect()
    }

    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let content_type = request
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = request.into_body().collect_bytes().await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        let (status, value) = self.respond(method, path, &content_type, body);
        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap()
    }

    fn respond(
        &self,
        method: Method,
        path: String,
        content_type: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut state = self.state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            path: path.clone(),
            body: body.clone(),
        });

        if let Some((_, _, status)) = state
            .failures
            .iter()
            .find(|(m, p, _)| *m == method && *p == path)
        {
            return error(*status, "injected failure");
        }

        let key = path.strip_suffix("/status").unwrap_or(&path).to_string();
        match method {
            Method::GET if is_collection(&key) => (StatusCode::OK, state.list(&key)),
            Method::GET => match state.objects.get(&key) {
                Some(object) => (StatusCode::OK, object.clone()),
                None => error(StatusCode::NOT_FOUND, &format!("{} not found", key)),
            },
            Method::POST => {
                let name = body["metadata"]["name"].as_str().unwrap_or_default();
                let key = format!("{}/{}", key, name);
                if state.objects.contains_key(&key) {
                    return error(StatusCode::CONFLICT, &format!("{} already exists", key));
                }
                (StatusCode::CREATED, state.commit(&key, body, None))
            }
            Method::PUT => {
                let Some(previous) = state.objects.get(&key).cloned() else {
                    return error(StatusCode::NOT_FOUND, &format!("{} not found", key));
                };
                if let Some(version) = body["metadata"]["resourceVersion"].as_str()
                    && Some(version) != previous["metadata"]["resourceVersion"].as_str()
                {
                    return error(StatusCode::CONFLICT, "resourceVersion mismatch");
                }
                (StatusCode::OK, state.commit(&key, body, Some(previous)))
            }
            Method::PATCH => {
                let previous = state.objects.get(&key).cloned();
                let Some(mut object) = previous.clone() else {
                    if content_type.contains("apply-patch") {
                        return (StatusCode::CREATED, state.commit(&key, body, None));
                    }
                    return error(StatusCode::NOT_FOUND, &format!("{} not found", key));
                };
                if let Some(version) = body["metadata"]["resourceVersion"].as_str()
                    && Some(version) != object["metadata"]["resourceVersion"].as_str()
                {
                    return error(StatusCode::CONFLICT, "resourceVersion mismatch");
                }
                json_patch::merge(&mut object, &body);
                (StatusCode::OK, state.commit(&key, object, previous))
            }
            Method::DELETE => match state.objects.remove(&key) {
                Some(object) => (StatusCode::OK, object),
                None => error(StatusCode::NOT_FOUND, &format!("{} not found", key)),
            },
            _ => error(StatusCode::METHOD_NOT_ALLOWED, "unsupported method"),
        }
    }
}

impl State {
    /// Store `object` under `key`, filling in the fields the server owns
    fn commit(&mut self, key: &str, mut object: Value, previous: Option<Value>) -> Value {
        match &previous {
            Some(previous) => {
                for field in ["uid", "generation", "resourceVersion"] {
                    if object["metadata"].get(field).is_none() {
                        object["metadata"][field] = previous["metadata"][field].clone();
                    }
                }
                if object.get("spec") != previous.get("spec") {
                    let generation = previous["metadata"]["generation"].as_i64().unwrap_or(0);
                    object["metadata"]["generation"] = json!(generation + 1);
                }
            }
            None => {
                if object["metadata"].get("uid").is_none() {
                    object["metadata"]["uid"] = json!(format!("uid-{}", self.last_version + 1));
                }
                if object["metadata"].get("generation").is_none() {
                    object["metadata"]["generation"] = json!(1);
                }
            }
        }

        if self.ready_statefulsets && key.contains("/statefulsets/") {
            mark_rolled_out(&mut object);
        }

        let changed = previous
            .as_ref()
            .is_none_or(|previous| without_version(previous) != without_version(&object));
        if changed {
            self.last_version += 1;
            object["metadata"]["resourceVersion"] = json!(self.last_version.to_string());
        }

        self.objects.insert(key.to_string(), object.clone());
        object
    }

    /// Every object directly under a collection path. Selectors are ignored.
    fn list(&self, collection: &str) -> Value {
        let prefix = format!("{}/", collection);
        let items: Vec<Value> = self
            .objects
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .map(|(_, object)| object.clone())
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {"resourceVersion": self.last_version.to_string()},
            "items": items
        })
    }
}

fn is_collection(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let rest = match segments.first() {
        Some(&"api") => &segments[2.min(segments.len())..],
        _ => &segments[3.min(segments.len())..],
    };
    match rest {
        ["namespaces", _, _] => true,
        ["namespaces", ..] => false,
        [_] => true,
        _ => false,
    }
}

fn without_version(object: &Value) -> Value {
    let mut object = object.clone();
    if let Some(meta) = object["metadata"].as_object_mut() {
        meta.remove("resourceVersion");
        meta.remove("managedFields");
    }
    object
}

fn mark_rolled_out(statefulset: &mut Value) {
    let replicas = statefulset["spec"]["replicas"].as_i64().unwrap_or(1);
    statefulset["status"] = json!({
        "replicas": replicas,
        "readyReplicas": replicas,
        "currentReplicas": replicas,
        "updatedReplicas": replicas,
        "availableReplicas": replicas,
        "observedGeneration": statefulset["metadata"]["generation"].clone()
    });
}

fn error(status: StatusCode, message: &str) -> (StatusCode, Value) {
    let reason = match status {
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::CONFLICT => "Conflict",
        StatusCode::FORBIDDEN => "Forbidden",
        _ => "InternalError",
    };
    (
        status,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": status.as_u16()
        }),
    )
}
