use kube::{
    api::{Patch, PatchParams},
    Api, Error, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use source_operator_crd::SOURCE_FINALIZER;

/// Adds the operator finalizer to a resource, keeping any foreign
/// finalizers in place. A no-op when the finalizer is already present.
pub(crate) async fn add<K>(api: &Api<K>, object: &K) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let mut finalizers = object.finalizers().to_vec();
    if finalizers
        .iter()
        .any(|finalizer| finalizer == SOURCE_FINALIZER)
    {
        return Ok(());
    }
    finalizers.push(SOURCE_FINALIZER.to_string());
    patch_finalizers(api, &object.name_any(), finalizers).await
}

/// Removes the operator finalizer, releasing the object for deletion.
pub(crate) async fn remove<K>(api: &Api<K>, object: &K) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let finalizers: Vec<String> = object
        .finalizers()
        .iter()
        .filter(|finalizer| *finalizer != SOURCE_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, &object.name_any(), finalizers).await
}

pub(crate) fn has_finalizer<K>(object: &K) -> bool
where
    K: Resource<DynamicType = ()>,
{
    object
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == SOURCE_FINALIZER)
}

async fn patch_finalizers<K>(api: &Api<K>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch: Value = json!({
      "metadata": {
          "finalizers": finalizers
      }
    });

    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
