//! Resource persistence via server-side apply.
//!
//! All managed objects go through `persist`, which applies the desired state
//! with a fixed field manager and reports whether anything actually changed.
//! Actors use the result to decide whether the cluster needs time to settle
//! before the next step.

use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::controller::{Error, Result};

/// Field manager for server-side apply operations
pub const FIELD_MANAGER: &str = "cockroach-operator";

/// Outcome of persisting a resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PersistResult {
    /// The object did not exist and was created.
    Created,
    /// The object existed and was modified.
    Updated,
    /// The applied state matched what was already there.
    Unchanged,
}

impl PersistResult {
    /// Whether the apply changed the live object.
    pub fn changed(self) -> bool {
        !matches!(self, PersistResult::Unchanged)
    }
}

/// Inject apiVersion/kind into a serialized object. Typed k8s-openapi values
/// serialize without their type meta, but server-side apply requires it.
fn with_type_meta(
    mut value: serde_json::Value,
    api_version: &str,
    kind: &str,
) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("apiVersion".to_string(), api_version.into());
        obj.insert("kind".to_string(), kind.into());
    }
    value
}

/// Apply the desired state of an object, creating it when absent.
pub async fn persist<K>(api: &Api<K>, desired: &K) -> Result<PersistResult>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingField("metadata.name".to_string()))?;

    let existing = api.get_opt(&name).await?;

    let value = with_type_meta(
        serde_json::to_value(desired)?,
        &K::api_version(&()),
        &K::kind(&()),
    );

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let applied = api
        .patch(&name, &params, &Patch::Apply(&value))
        .await
        .map_err(|e| match e {
            kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict(name.clone()),
            other => other.into(),
        })?;

    let result = match existing {
        None => PersistResult::Created,
        Some(prev) if prev.meta().resource_version == applied.meta().resource_version => {
            PersistResult::Unchanged
        }
        Some(_) => PersistResult::Updated,
    };

    debug!(
        kind = %K::kind(&()),
        name = %name,
        result = ?result,
        "persisted resource"
    );

    Ok(result)
}
