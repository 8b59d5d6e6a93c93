//! Condition types and reason codes shared by all reconciled kinds.
//!
//! Negative-polarity conditions signal failure when their status is True;
//! `SourceVerified` is bi-polar (True means verified, False means the
//! verification itself failed).

/// Ready is the summary condition derived from the sub-conditions.
pub const READY: &str = "Ready";

/// Stalled marks a terminal-until-input-changes state; the operator will
/// not retry until the generation or the reconcile-request annotation
/// changes.
pub const STALLED: &str = "Stalled";

/// Reconciling is set while a reconciliation is making progress towards a
/// new artifact.
pub const RECONCILING: &str = "Reconciling";

pub const FETCH_FAILED: &str = "FetchFailed";
pub const BUILD_FAILED: &str = "BuildFailed";
pub const STORAGE_OPERATION_FAILED: &str = "StorageOperationFailed";
pub const ARTIFACT_OUTDATED: &str = "ArtifactOutdated";
pub const ARTIFACT_IN_STORAGE: &str = "ArtifactInStorage";
pub const SOURCE_VERIFIED: &str = "SourceVerified";

/// Negative-polarity sub-conditions ordered worst first. The summary picks
/// the first of these that is True as the Ready=False reason.
pub const NEGATIVE_CONDITIONS: &[&str] = &[
    STORAGE_OPERATION_FAILED,
    BUILD_FAILED,
    FETCH_FAILED,
    ARTIFACT_OUTDATED,
];

pub mod reason {
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const PROGRESSING: &str = "Progressing";
    pub const PROGRESSING_WITH_RETRY: &str = "ProgressingWithRetry";

    pub const CHART_PULL_SUCCEEDED: &str = "ChartPullSucceeded";
    pub const CHART_PACKAGE_SUCCEEDED: &str = "ChartPackageSucceeded";
    pub const NEW_ARTIFACT: &str = "NewArtifact";
    pub const ARTIFACT_UP_TO_DATE: &str = "ArtifactUpToDate";
    pub const GARBAGE_COLLECTION_SUCCEEDED: &str = "GarbageCollectionSucceeded";
    pub const GARBAGE_COLLECTION_FAILED: &str = "GarbageCollectionFailed";

    pub const AUTHENTICATION_FAILED: &str = "AuthenticationFailed";
    pub const VERIFICATION_ERROR: &str = "VerificationError";
    pub const NO_SOURCE_ARTIFACT: &str = "NoSourceArtifact";
    pub const URL_INVALID: &str = "URLInvalid";
    pub const UNSUPPORTED_SOURCE_KIND: &str = "UnsupportedSourceKind";
    pub const INVALID_CHART_REFERENCE: &str = "InvalidChartReference";
    pub const STORAGE_OPERATION_FAILED: &str = "StorageOperationFailed";
    pub const DELETION_FAILED: &str = "DeletionFailed";
}
