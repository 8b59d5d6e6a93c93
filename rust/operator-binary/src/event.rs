use kube::{
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
    },
    Client, Resource,
};

use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to publish event: {}", source))]
    PublishEvent { source: kube::Error },
}

pub const REPORTER: &str = "source-operator";

/// Publishes a structured event for a reconciled object.
pub async fn publish<K>(
    object: &K,
    client: Client,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) -> Result<(), Error>
where
    K: Resource<DynamicType = ()>,
{
    let reporter: Reporter = REPORTER.into();
    let object_ref = ObjectRef::from_obj(object);

    let recorder = Recorder::new(client, reporter, object_ref.into());
    recorder
        .publish(Event {
            action: "Reconcile".into(),
            reason: reason.into(),
            note,
            type_,
            secondary: None,
        })
        .await
        .context(PublishEventSnafu)
}

/// Note text for a new-artifact event. The events API has no annotation
/// map, so the revision and checksum travel in the note.
pub fn new_artifact_note(revision: &str, checksum: Option<&str>) -> String {
    match checksum {
        Some(checksum) => {
            format!("stored artifact for revision '{revision}' (checksum '{checksum}')")
        }
        None => format!("stored artifact for revision '{revision}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_artifact_note_carries_revision_and_checksum() {
        assert_eq!(
            new_artifact_note("6.2.0", Some("sha256:abc")),
            "stored artifact for revision '6.2.0' (checksum 'sha256:abc')"
        );
        assert_eq!(
            new_artifact_note("latest/abc", None),
            "stored artifact for revision 'latest/abc'"
        );
    }
}
