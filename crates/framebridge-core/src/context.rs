//! Shared application/navigation context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::now_millis;

/// One entry of the breadcrumb trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub label: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Breadcrumb {
    /// Create a breadcrumb without params.
    #[must_use]
    pub fn new(label: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
            params: None,
        }
    }
}

/// Navigation half of the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationState {
    pub current_route: String,
    #[serde(default)]
    pub previous_route: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default)]
    pub state: Option<Value>,
    /// Navigation stack, most recent last.
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
}

impl NavigationState {
    /// Navigation state sitting at `route` with no history.
    #[must_use]
    pub fn at(route: impl Into<String>) -> Self {
        Self {
            current_route: route.into(),
            previous_route: None,
            params: Map::new(),
            query: Map::new(),
            state: None,
            breadcrumbs: Vec::new(),
        }
    }
}

/// Application half of the context.
///
/// Keys other than the known ones are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Value>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_environment() -> String {
    "production".to_string()
}

impl AppState {
    /// Empty app state for the given environment.
    #[must_use]
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            user: None,
            session: None,
            preferences: None,
            features: None,
            environment: environment.into(),
            extra: Map::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(default_environment())
    }
}

/// The shared state document kept eventually consistent between host and guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: String,
    pub route: String,
    pub navigation: NavigationState,
    pub app: AppState,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Context {
    /// Create a fresh context sitting at `route`.
    #[must_use]
    pub fn new(route: impl Into<String>, environment: impl Into<String>) -> Self {
        let route = route.into();
        let now = now_millis();
        Self {
            id: format!("ctx_{}", uuid::Uuid::new_v4().simple()),
            navigation: NavigationState::at(route.clone()),
            route,
            app: AppState::new(environment),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Shallow-merge `patch` into a copy of this context.
    ///
    /// Each top-level key of the patch replaces the corresponding key
    /// wholesale; nested objects are not merged. `updatedAt` is always
    /// bumped past its previous value, whatever the patch carries.
    ///
    /// # Errors
    /// Returns error if the merged document is no longer a valid context.
    pub fn merged(&self, patch: &ContextPatch) -> Result<Self, PatchError> {
        let mut doc = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(PatchError::NotAnObject),
        };
        for (key, value) in &patch.0 {
            doc.insert(key.clone(), value.clone());
        }
        let mut next: Self = serde_json::from_value(Value::Object(doc))?;
        next.updated_at = now_millis().max(self.updated_at.saturating_add(1));
        Ok(next)
    }
}

/// Patch merge error.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Patch is not a JSON object")]
    NotAnObject,
    #[error("Invalid patch: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Partial context update: top-level keys that replace their counterparts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextPatch(Map<String, Value>);

impl ContextPatch {
    /// Empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an arbitrary top-level key.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Replace `route`.
    #[must_use]
    pub fn route(self, route: impl Into<String>) -> Self {
        self.set("route", Value::String(route.into()))
    }

    /// Replace the whole `navigation` object.
    #[must_use]
    pub fn navigation(self, navigation: &NavigationState) -> Self {
        self.set("navigation", to_value_or_null(navigation))
    }

    /// Replace the whole `app` object.
    #[must_use]
    pub fn app(self, app: &AppState) -> Self {
        self.set("app", to_value_or_null(app))
    }

    /// Replace the whole `metadata` object.
    #[must_use]
    pub fn metadata(self, metadata: Map<String, Value>) -> Self {
        self.set("metadata", Value::Object(metadata))
    }

    /// Patch that replaces every key of `context`.
    #[must_use]
    pub fn full(context: &Context) -> Self {
        match serde_json::to_value(context) {
            Ok(Value::Object(map)) => Self(map),
            _ => Self::default(),
        }
    }

    /// Interpret a JSON value as a patch. Only objects qualify.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn to_value_or_null<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
