pub mod credentials;
pub mod index;
pub mod verify;

use std::time::Duration;

use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol, ImageData, ImageLayer,
};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::{Client, ParseError, RegistryOperation};
use semver::{Version, VersionReq};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::debug;

use source_operator_crd::OCIRepositoryRef;

pub use oci_distribution::secrets::RegistryAuth;
pub use oci_distribution::Reference;

/// Media type of the packaged chart layer in an OCI Helm artifact.
pub const HELM_CHART_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
/// Media type of the chart metadata config in an OCI Helm artifact.
pub const HELM_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.helm.config.v1+json";
/// Media type of packaged source trees in generic OCI artifacts.
pub const SOURCE_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.flux.content.v1.tar+gzip";
/// Fallbacks accepted when pulling arbitrary artifact layers.
pub const GENERIC_CONTENT_MEDIA_TYPES: &[&str] = &[
    SOURCE_CONTENT_MEDIA_TYPE,
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/tar+gzip",
];

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Invalid registry URL {:?}", url))]
    InvalidUrl { url: String },

    #[snafu(display("Failed to parse OCI reference: {}", source))]
    ParseReference { source: ParseError },

    #[snafu(display("Failed to auth against registry: {}", source))]
    Auth { source: OciDistributionError },

    #[snafu(display("Failed to list tags: {}", source))]
    ListTags { source: OciDistributionError },

    #[snafu(display("Failed to resolve digest: {}", source))]
    ResolveDigest { source: OciDistributionError },

    #[snafu(display("Failed to pull artifact: {}", source))]
    Pull { source: OciDistributionError },

    #[snafu(display("Invalid semver range {:?}: {}", range, source))]
    InvalidSemverRange {
        range: String,
        source: semver::Error,
    },

    #[snafu(display("Invalid semver filter {:?}: {}", filter, source))]
    InvalidSemverFilter {
        filter: String,
        source: regex::Error,
    },

    #[snafu(display("No tag matches semver range {:?}", range))]
    NoMatchingTag { range: String },

    #[snafu(display("Artifact has no layer of media type {:?}", media_type))]
    MissingLayer { media_type: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Spec-input errors park the object until the spec changes; anything
    /// else is worth a retry.
    pub fn is_stalling(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl { .. }
                | Error::InvalidSemverRange { .. }
                | Error::InvalidSemverFilter { .. }
        )
    }
}

/// TLS material extracted from a cert secret (`ca.crt`, `tls.crt`,
/// `tls.key`).
#[derive(Debug, Default)]
pub struct TlsMaterial {
    pub ca_certificate: Option<Vec<u8>>,
    pub client_certificate: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
}

/// The reference an OCI pull resolved to, and the revision advertised for
/// it.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedReference {
    pub reference: Reference,
    /// `tag "/" digestHex`, or the bare digest hex for digest pins.
    pub revision: String,
    /// The full `sha256:<hex>` manifest digest.
    pub digest: String,
}

/// A registry client scoped to one reconciliation. Dropping it releases
/// the underlying connections; credential files are owned by the caller's
/// [`credentials::RegistryLogin`].
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(
        auth: RegistryAuth,
        insecure: bool,
        tls: Option<&TlsMaterial>,
        timeout: Duration,
    ) -> Self {
        let mut extra_root_certificates = Vec::new();
        if let Some(ca) = tls.and_then(|tls| tls.ca_certificate.as_ref()) {
            extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data: ca.clone(),
            });
        }
        let config = ClientConfig {
            protocol: if insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: insecure,
            extra_root_certificates,
            read_timeout: Some(timeout),
            connect_timeout: Some(timeout),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Parses an `oci://` repository URL into a reference without a tag.
    pub fn parse_url(url: &str) -> Result<Reference> {
        let stripped = url
            .strip_prefix("oci://")
            .context(InvalidUrlSnafu { url })?
            .trim_end_matches('/');
        if stripped.is_empty() || !stripped.contains('/') {
            return InvalidUrlSnafu { url }.fail();
        }
        stripped.parse().context(ParseReferenceSnafu)
    }

    pub async fn login(&mut self, reference: &Reference) -> Result<()> {
        self.client
            .auth(reference, &self.auth, RegistryOperation::Pull)
            .await
            .context(AuthSnafu)?;
        Ok(())
    }

    pub async fn list_tags(&mut self, reference: &Reference) -> Result<Vec<String>> {
        let response = self
            .client
            .list_tags(reference, &self.auth, None, None)
            .await
            .context(ListTagsSnafu)?;
        Ok(response.tags)
    }

    pub async fn digest(&mut self, reference: &Reference) -> Result<String> {
        self.client
            .fetch_manifest_digest(reference, &self.auth)
            .await
            .context(ResolveDigestSnafu)
    }

    pub async fn pull(
        &mut self,
        reference: &Reference,
        accepted_media_types: &[&str],
    ) -> Result<ImageData> {
        self.client
            .pull(reference, &self.auth, accepted_media_types.to_vec())
            .await
            .context(PullSnafu)
    }

    /// Resolves the repository URL plus an optional reference block to a
    /// pinned reference. Priority: digest over semver over tag over the
    /// implicit `latest`.
    pub async fn resolve(
        &mut self,
        url: &str,
        spec: Option<&OCIRepositoryRef>,
    ) -> Result<ResolvedReference> {
        let base = Self::parse_url(url)?;

        if let Some(digest) = spec.and_then(|spec| spec.digest.as_deref()) {
            let reference = Reference::with_digest(
                base.registry().to_string(),
                base.repository().to_string(),
                digest.to_string(),
            );
            return Ok(ResolvedReference {
                revision: digest_hex(digest).to_string(),
                digest: digest.to_string(),
                reference,
            });
        }

        let tag = match spec.and_then(|spec| spec.semver.as_deref()) {
            Some(range) => {
                let tags = self.list_tags(&base).await?;
                select_semver_tag(
                    &tags,
                    range,
                    spec.and_then(|spec| spec.semver_filter.as_deref()),
                )?
            }
            None => spec
                .and_then(|spec| spec.tag.clone())
                .unwrap_or_else(|| "latest".to_string()),
        };

        let reference = Reference::with_tag(
            base.registry().to_string(),
            base.repository().to_string(),
            tag.clone(),
        );
        let digest = self.digest(&reference).await?;
        debug!("Resolved {} to {}@{}", url, tag, digest);
        Ok(ResolvedReference {
            revision: format!("{}/{}", tag, digest_hex(&digest)),
            digest,
            reference,
        })
    }
}

/// Picks the first layer matching any of the accepted media types, in
/// order of preference.
pub fn select_layer<'a>(
    image: &'a ImageData,
    accepted_media_types: &[&str],
) -> Result<&'a ImageLayer> {
    for media_type in accepted_media_types {
        if let Some(layer) = image
            .layers
            .iter()
            .find(|layer| layer.media_type == *media_type)
        {
            return Ok(layer);
        }
    }
    MissingLayerSnafu {
        media_type: accepted_media_types.join(", "),
    }
    .fail()
}

/// The hex part of a `<algorithm>:<hex>` digest.
pub fn digest_hex(digest: &str) -> &str {
    digest
        .split_once(':')
        .map(|(_, hex)| hex)
        .unwrap_or(digest)
}

/// Selects the highest tag that parses as a semantic version and matches
/// the range. Tags that fail to parse are skipped silently; an optional
/// regex filter restricts the candidate set first.
pub fn select_semver_tag(tags: &[String], range: &str, filter: Option<&str>) -> Result<String> {
    let range_req = VersionReq::parse(&normalize_range(range)).context(InvalidSemverRangeSnafu {
        range: range.to_string(),
    })?;
    let filter = filter
        .map(|pattern| {
            regex::Regex::new(pattern).context(InvalidSemverFilterSnafu {
                filter: pattern.to_string(),
            })
        })
        .transpose()?;

    let mut candidates: Vec<(Version, &String)> = tags
        .iter()
        .filter(|tag| {
            filter
                .as_ref()
                .map(|filter| filter.is_match(tag))
                .unwrap_or(true)
        })
        .filter_map(|tag| {
            let stripped = tag.strip_prefix('v').unwrap_or(tag);
            Version::parse(stripped).ok().map(|version| (version, tag))
        })
        .filter(|(version, _)| range_req.matches(version))
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates
        .into_iter()
        .next()
        .map(|(_, tag)| tag.clone())
        .context(NoMatchingTagSnafu { range })
}

/// Helm-style ranges separate constraints with spaces; the semver crate
/// wants commas.
fn normalize_range(range: &str) -> String {
    let trimmed = range.trim();
    if trimmed.contains(',') {
        return trimmed.to_string();
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(", ")
}
