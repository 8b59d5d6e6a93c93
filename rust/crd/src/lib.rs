pub mod condition;
pub mod helm_chart;
pub mod helm_repository;
pub mod oci_repository;
pub mod source;

pub use helm_chart::*;
pub use helm_repository::*;
pub use oci_repository::*;
pub use source::*;

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const API_GROUP: &str = "source.toolkit.dev";
pub const API_VERSION: &str = "v1beta2";

/// Finalizer the operator sets on every resource it manages. An object is
/// only released for deletion once its artifact subtree has been removed.
pub const SOURCE_FINALIZER: &str = "source.toolkit.dev/finalizer";

/// Annotation a user sets to force a reconciliation outside the regular
/// interval. The handled value is mirrored to `status.lastHandledReconcileAt`.
pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.toolkit/requestedAt";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("invalid duration {:?}: {}", value, source))]
    InvalidDuration {
        value: String,
        source: humantime::DurationError,
    },
}

/// LocalObjectReference names a referent in the same namespace as the
/// referring resource.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct LocalObjectReference {
    /// Name of the referent.
    pub name: String,
}

/// Artifact represents the output of a source reconciliation: an immutable
/// packaged tarball below the storage root, addressable by URL.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Revision is a human-readable identifier traceable in the origin
    /// source system: a chart version, an OCI digest or a Git SHA, with an
    /// optional metadata suffix.
    pub revision: String,

    /// Path is the relative file path of the artifact below the storage
    /// root on the local file system of the controller.
    pub path: String,

    /// URL is the HTTP address of the artifact as exposed by the
    /// controller's file server.
    pub url: String,

    /// Digest of the file in the form '<algorithm>:<checksum>'.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// LastUpdateTime is the timestamp corresponding to the last update of
    /// the artifact file.
    pub last_update_time: Time,

    /// Metadata holds upstream information such as OCI annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,

    /// Size is the number of bytes in the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl Artifact {
    /// The hex part of the digest, without the algorithm prefix.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest
            .as_deref()
            .and_then(|digest| digest.split_once(':'))
            .map(|(_, hex)| hex)
    }

    pub fn has_revision(&self, revision: &str) -> bool {
        self.revision == revision
    }

    /// Filename component of the artifact path.
    pub fn filename(&self) -> Option<&str> {
        self.path.rsplit('/').next()
    }
}

/// SourceVerification configures signature verification of a pulled
/// artifact or chart.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVerification {
    /// Provider specifies the technology used to sign the artifact.
    pub provider: VerificationProvider,

    /// SecretRef specifies the Kubernetes Secret containing the trusted
    /// public keys; entries whose name ends in `.pub` are candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// MatchOIDCIdentity specifies the identity matching criteria used
    /// during keyless verification. The artifact is verified if any of the
    /// matchers match against the signing identity.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "matchOIDCIdentity"
    )]
    pub match_oidc_identity: Option<Vec<OidcIdentityMatch>>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum VerificationProvider {
    #[default]
    #[serde(rename = "cosign")]
    Cosign,
}

/// OIDCIdentityMatch specifies regex patterns matched against the issuer
/// and subject of the Fulcio certificate during keyless verification.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct OidcIdentityMatch {
    pub issuer: String,
    pub subject: String,
}

/// Parses a spec duration string ("60s", "10m", "1h 30m").
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    humantime::parse_duration(value).context(InvalidDurationSnafu { value })
}

/// The current value of the reconcile-request annotation, if set.
pub fn reconcile_annotation_value(meta: &ObjectMeta) -> Option<String> {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(RECONCILE_REQUEST_ANNOTATION))
        .cloned()
}
