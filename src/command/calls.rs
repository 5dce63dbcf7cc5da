//! Concrete remote calls against the entity collections.

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::error::RemoteError;
use super::executor::RemoteCall;
use crate::domain::{Entity, EntityId, EntityKind, EntityPatch};
use crate::fetch_key::FetchParams;

// =============================================================================
// JSON Transport
// =============================================================================

/// HTTP verb of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// Upper-case verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Seam between the concrete calls and the wire.
///
/// Paths are relative to the API base URL. Successful responses with an
/// empty body are reported as [`Value::Null`].
pub trait JsonTransport: Send + Sync {
    /// `GET path?query`.
    fn get_json(&self, path: &str, query: &FetchParams)
    -> BoxFuture<'static, Result<Value, RemoteError>>;

    /// Sends `body` with `method` to `path`.
    fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> BoxFuture<'static, Result<Value, RemoteError>>;
}

// =============================================================================
// Response Decoding
// =============================================================================

/// Decodes `{ <collection>: [...] }` or a bare array.
///
/// # Errors
///
/// Returns [`RemoteError::Decode`] when the collection is missing or any
/// element is not a valid entity of `kind`.
pub fn decode_collection(kind: EntityKind, body: &Value) -> Result<Vec<Entity>, RemoteError> {
    let field = kind.collection_field();
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| RemoteError::Decode(format!("missing `{field}` array")))?,
        other => {
            return Err(RemoteError::Decode(format!(
                "expected `{field}` collection, got {}",
                json_type(other)
            )));
        }
    };
    items
        .iter()
        .enumerate()
        .map(|(index, document)| {
            Entity::from_json(kind, document)
                .map_err(|error| RemoteError::Decode(format!("{field}[{index}]: {error}")))
        })
        .collect()
}

/// Decodes `{ <entity>: {...} }` or a bare entity object.
///
/// # Errors
///
/// Returns [`RemoteError::Decode`] when the body holds no valid entity of `kind`.
pub fn decode_entity(kind: EntityKind, body: &Value) -> Result<Entity, RemoteError> {
    let field = kind.entity_field();
    let document = match body.get(field) {
        Some(document @ Value::Object(_)) => document,
        _ if body.is_object() => body,
        _ => {
            return Err(RemoteError::Decode(format!(
                "expected `{field}` object, got {}",
                json_type(body)
            )));
        }
    };
    Entity::from_json(kind, document).map_err(|error| RemoteError::Decode(format!("{field}: {error}")))
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Fetch Collection
// =============================================================================

/// `GET <path>?params` returning every entity of a kind.
#[derive(Clone)]
pub struct FetchCollection {
    transport: Arc<dyn JsonTransport>,
    kind: EntityKind,
    path: String,
    name: String,
}

impl FetchCollection {
    /// Fetches `kind` from its default collection path.
    #[must_use]
    pub fn new(transport: Arc<dyn JsonTransport>, kind: EntityKind) -> Self {
        Self::at(transport, kind, kind.collection_path())
    }

    /// Fetches `kind` from a custom path (`/tickets/assigned`).
    #[must_use]
    pub fn at(transport: Arc<dyn JsonTransport>, kind: EntityKind, path: impl Into<String>) -> Self {
        Self {
            transport,
            kind,
            path: path.into(),
            name: format!("fetch {}", kind.collection_field()),
        }
    }

    /// Kind this call decodes.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Endpoint path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for FetchCollection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("FetchCollection")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RemoteCall for FetchCollection {
    type Args = FetchParams;
    type Output = Vec<Entity>;

    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, params: FetchParams) -> BoxFuture<'static, Result<Vec<Entity>, RemoteError>> {
        let kind = self.kind;
        let response = self.transport.get_json(&self.path, &params);
        async move { decode_collection(kind, &response.await?) }.boxed()
    }
}

// =============================================================================
// Fetch Entity
// =============================================================================

/// `GET <path>/<id>` returning one entity.
#[derive(Clone)]
pub struct FetchEntity {
    transport: Arc<dyn JsonTransport>,
    kind: EntityKind,
    name: String,
}

impl FetchEntity {
    /// Creates the call for `kind`.
    #[must_use]
    pub fn new(transport: Arc<dyn JsonTransport>, kind: EntityKind) -> Self {
        Self {
            transport,
            kind,
            name: format!("fetch {}", kind.entity_field()),
        }
    }
}

impl fmt::Debug for FetchEntity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("FetchEntity")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl RemoteCall for FetchEntity {
    type Args = EntityId;
    type Output = Entity;

    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, id: EntityId) -> BoxFuture<'static, Result<Entity, RemoteError>> {
        let kind = self.kind;
        let path = format!("{}/{id}", kind.collection_path());
        let response = self.transport.get_json(&path, &FetchParams::new());
        async move { decode_entity(kind, &response.await?) }.boxed()
    }
}

// =============================================================================
// Patch Entity
// =============================================================================

/// `PATCH <path>/<id>` with a partial update.
///
/// Resolves to the updated entity when the server echoes it back, `None`
/// when the body is empty or does not hold an entity.
#[derive(Clone)]
pub struct PatchEntity {
    transport: Arc<dyn JsonTransport>,
    kind: EntityKind,
    name: String,
}

impl PatchEntity {
    /// Creates the call for `kind`.
    #[must_use]
    pub fn new(transport: Arc<dyn JsonTransport>, kind: EntityKind) -> Self {
        Self {
            transport,
            kind,
            name: format!("update {}", kind.entity_field()),
        }
    }
}

impl fmt::Debug for PatchEntity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PatchEntity")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl RemoteCall for PatchEntity {
    type Args = (EntityId, EntityPatch);
    type Output = Option<Entity>;

    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        (id, patch): (EntityId, EntityPatch),
    ) -> BoxFuture<'static, Result<Option<Entity>, RemoteError>> {
        let kind = self.kind;
        let path = format!("{}/{id}", kind.collection_path());
        let body = match patch.to_body(kind) {
            Ok(body) => body,
            Err(error) => {
                return futures::future::ready(Err(RemoteError::Decode(error.to_string()))).boxed();
            }
        };
        let response = self.transport.send_json(Method::Patch, &path, body);
        async move {
            let body = response.await?;
            if body.is_null() {
                return Ok(None);
            }
            match decode_entity(kind, &body) {
                Ok(entity) => Ok(Some(entity)),
                Err(error) => {
                    tracing::debug!(%kind, %error, "update response carries no entity");
                    Ok(None)
                }
            }
        }
        .boxed()
    }
}
