use std::collections::HashMap;
use std::sync::Arc;

use revalid_core::HttpMethod;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::background::Background;
use crate::store::{OfflineStore, StoreError, cache_key, now_millis};

#[derive(Debug, Error)]
pub enum OptimisticError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cached value for {0} is not a list")]
    NotAList(String),
    #[error("request body for {0} is not an object")]
    InvalidBody(String),
    #[error("timestamp formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

pub type SerializeFn = fn(&Map<String, Value>) -> Map<String, Value>;
pub type MergeFn = fn(&mut Map<String, Value>, &Map<String, Value>);

/// How submitted fields become a cached list item for one resource.
#[derive(Clone, Copy)]
pub struct ResourceShape {
    pub serialize: SerializeFn,
    pub merge: MergeFn,
}

impl ResourceShape {
    /// Server lists use camelCase keys while request bodies use snake_case.
    pub const CAMEL_CASE: ResourceShape = ResourceShape {
        serialize: camel_case_fields,
        merge: merge_camel_case,
    };
}

pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "/api/v1/cpd-hours",
    "/api/v1/work-hours",
    "/api/v1/feedback",
    "/api/v1/reflections",
    "/api/v1/appraisals",
    "/api/v1/calendar/events",
    "/api/v1/documents",
];

/// Closed set of collections the updater may touch.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    shapes: HashMap<String, ResourceShape>,
}

impl ResourceRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        for collection in DEFAULT_COLLECTIONS {
            registry.register(collection, ResourceShape::CAMEL_CASE);
        }
        registry
    }

    pub fn register(&mut self, collection: &str, shape: ResourceShape) -> &mut Self {
        self.shapes.insert(cache_key(collection), shape);
        self
    }

    pub fn shape_for(&self, collection: &str) -> Option<&ResourceShape> {
        self.shapes.get(&cache_key(collection))
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.shapes.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Skipped,
    Inserted { id: i64 },
    Merged { id: i64 },
    Removed { id: i64 },
}

#[derive(Clone)]
pub struct OptimisticUpdater {
    store: OfflineStore,
    registry: Arc<ResourceRegistry>,
    background: Background,
}

impl OptimisticUpdater {
    pub fn new(store: OfflineStore, registry: Arc<ResourceRegistry>, background: Background) -> Self {
        Self {
            store,
            registry,
            background,
        }
    }

    /// Best-effort patch of the cached collection. Failures are reported to the
    /// failure sink and never returned.
    pub async fn apply(&self, method: HttpMethod, endpoint: &str, body: Option<&Value>) {
        match self.try_apply(method, endpoint, body).await {
            Ok(outcome) => debug!(%method, endpoint, ?outcome, "optimistic update"),
            Err(err) => self.background.report("optimistic update", &err),
        }
    }

    pub async fn try_apply(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<PatchOutcome, OptimisticError> {
        let (collection, item_id) = split_item_id(endpoint);
        let Some(shape) = self.registry.shape_for(collection) else {
            return Ok(PatchOutcome::Skipped);
        };
        let Some(entry) = self.store.cache_get(collection).await? else {
            return Ok(PatchOutcome::Skipped);
        };
        let mut cached = entry.value;
        let items = list_items_mut(&mut cached)
            .ok_or_else(|| OptimisticError::NotAList(collection.to_string()))?;

        let outcome = match (method, item_id) {
            (HttpMethod::Post, None) => {
                let fields = body_fields(collection, body)?;
                let id = placeholder_id(items);
                let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                let mut item = (shape.serialize)(&fields);
                item.insert("id".into(), Value::from(id));
                item.insert("createdAt".into(), Value::String(now.clone()));
                item.insert("updatedAt".into(), Value::String(now));
                item.insert("pendingSync".into(), Value::Bool(true));
                items.insert(0, Value::Object(item));
                PatchOutcome::Inserted { id }
            }
            (HttpMethod::Put | HttpMethod::Patch, Some(id)) => {
                let fields = body_fields(collection, body)?;
                let Some(item) = items
                    .iter_mut()
                    .filter_map(Value::as_object_mut)
                    .find(|item| item_has_id(item, id))
                else {
                    return Ok(PatchOutcome::Skipped);
                };
                (shape.merge)(item, &fields);
                item.insert(
                    "updatedAt".into(),
                    Value::String(OffsetDateTime::now_utc().format(&Rfc3339)?),
                );
                item.insert("pendingSync".into(), Value::Bool(true));
                PatchOutcome::Merged { id }
            }
            (HttpMethod::Delete, Some(id)) => {
                let before = items.len();
                items.retain(|item| !item.as_object().is_some_and(|item| item_has_id(item, id)));
                if items.len() == before {
                    return Ok(PatchOutcome::Skipped);
                }
                PatchOutcome::Removed { id }
            }
            _ => return Ok(PatchOutcome::Skipped),
        };

        self.store.cache_put(collection, &cached).await?;
        Ok(outcome)
    }
}

/// Splits a trailing numeric path segment off an endpoint.
pub fn split_item_id(endpoint: &str) -> (&str, Option<i64>) {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let path = path.trim_end_matches('/');
    if let Some((collection, last)) = path.rsplit_once('/')
        && !last.is_empty()
        && last.bytes().all(|b| b.is_ascii_digit())
        && let Ok(id) = last.parse::<i64>()
    {
        return (collection, Some(id));
    }
    (path, None)
}

fn list_items_mut(value: &mut Value) -> Option<&mut Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get_mut("data").and_then(Value::as_array_mut),
        _ => None,
    }
}

fn body_fields(collection: &str, body: Option<&Value>) -> Result<Map<String, Value>, OptimisticError> {
    match body {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(OptimisticError::InvalidBody(collection.to_string())),
    }
}

fn item_id(item: &Map<String, Value>) -> Option<i64> {
    match item.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn item_has_id(item: &Map<String, Value>, id: i64) -> bool {
    item_id(item) == Some(id)
}

/// Negative, below every id already in the list and below `-now_millis`.
fn placeholder_id(items: &[Value]) -> i64 {
    let lowest = items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(item_id)
        .min()
        .unwrap_or(0);
    (-now_millis()).min(lowest.min(0) - 1)
}

pub fn camel_case_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (to_camel_case(key), value.clone()))
        .collect()
}

pub fn merge_camel_case(item: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (key, value) in camel_case_fields(fields) {
        item.insert(key, value);
    }
}

fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}
