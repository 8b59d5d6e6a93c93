//! Artifact signature verification.
//!
//! Cosign is the only wired provider. With a key secret, every `.pub`
//! entry is a candidate verification key and any single match verifies
//! the artifact. Without one, keyless verification inspects the
//! certificate material attached to the signature layers, optionally
//! constrained by OIDC identity matchers.

use regex::Regex;
use sigstore::cosign::verification_constraint::{PublicKeyVerifier, VerificationConstraint};
use sigstore::cosign::{verify_constraints, ClientBuilder, CosignCapabilities};
use sigstore::crypto::SigningScheme;
use sigstore::errors::SigstoreError;
use sigstore::registry::{Auth as SigstoreAuth, OciReference};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, warn};

use source_operator_crd::{OidcIdentityMatch, SourceVerification, VerificationProvider};

use crate::credentials::Auth;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Verification against an insecure registry is not supported"))]
    InsecureRegistry,

    #[snafu(display("Failed to build verification client: {}", source))]
    ClientBuild { source: SigstoreError },

    #[snafu(display("Invalid artifact reference {:?}: {}", reference, source))]
    InvalidReference {
        reference: String,
        source: SigstoreError,
    },

    #[snafu(display("Failed to locate signatures for {}: {}", reference, source))]
    Triangulate {
        reference: String,
        source: SigstoreError,
    },

    #[snafu(display("Failed to fetch signature layers for {}: {}", reference, source))]
    FetchSignatures {
        reference: String,
        source: SigstoreError,
    },

    #[snafu(display("No signature of {} matches any of the {} candidate keys", reference, keys))]
    NoMatchingKey { reference: String, keys: usize },

    #[snafu(display("Verification secret {:?} contains no '.pub' entries", secret))]
    NoKeysInSecret { secret: String },

    #[snafu(display("No signatures found for {}", reference))]
    NoSignatures { reference: String },

    #[snafu(display(
        "No signature of {} carries an identity matching the configured matchers",
        reference
    ))]
    NoMatchingIdentity { reference: String },

    #[snafu(display("Invalid identity matcher {:?}: {}", pattern, source))]
    InvalidIdentityMatcher {
        pattern: String,
        source: regex::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// How an artifact passed verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifiedBy {
    /// The name of the secret entry whose key produced a valid signature.
    Key(String),
    Keyless,
}

/// Verifies the signature of the artifact behind `reference`.
///
/// `keys` are `(entry name, PEM bytes)` pairs from the verification
/// secret; an empty list switches to keyless verification.
pub async fn verify_artifact(
    reference: &str,
    auth: &Auth,
    verification: &SourceVerification,
    keys: &[(String, Vec<u8>)],
    insecure: bool,
) -> Result<VerifiedBy> {
    // A registry without TLS cannot anchor trust for signatures.
    if insecure {
        return InsecureRegistrySnafu.fail();
    }

    // Single provider today; the match keeps the dispatch point explicit.
    match verification.provider {
        VerificationProvider::Cosign => {}
    }

    // A referenced key secret with no usable entries can never verify.
    if keys.is_empty() {
        if let Some(secret) = &verification.secret_ref {
            return NoKeysInSecretSnafu {
                secret: secret.name.clone(),
            }
            .fail();
        }
    }

    let image: OciReference = reference.parse().context(InvalidReferenceSnafu { reference })?;
    let sigstore_auth = match auth {
        Auth::Anonymous => SigstoreAuth::Anonymous,
        Auth::Basic { username, password } => {
            SigstoreAuth::Basic(username.clone(), password.clone())
        }
    };

    let mut client = ClientBuilder::default().build().context(ClientBuildSnafu)?;
    let (signature_image, source_digest) = client
        .triangulate(&image, &sigstore_auth)
        .await
        .context(TriangulateSnafu { reference })?;
    let layers = client
        .trusted_signature_layers(&sigstore_auth, &source_digest, &signature_image)
        .await
        .context(FetchSignaturesSnafu { reference })?;

    if layers.is_empty() {
        return NoSignaturesSnafu { reference }.fail();
    }

    if !keys.is_empty() {
        for (name, pem) in keys {
            let verifier = match PublicKeyVerifier::new(pem, &SigningScheme::default()) {
                Ok(verifier) => verifier,
                Err(error) => {
                    warn!("Skipping unparsable verification key {}: {}", name, error);
                    continue;
                }
            };
            let constraints: Vec<Box<dyn VerificationConstraint>> = vec![Box::new(verifier)];
            if verify_constraints(&layers, constraints.iter()).is_ok() {
                debug!("Artifact {} verified with key {}", reference, name);
                return Ok(VerifiedBy::Key(name.clone()));
            }
        }
        return NoMatchingKeySnafu {
            reference,
            keys: keys.len(),
        }
        .fail();
    }

    // Keyless: at least one certified signature, with an identity matching
    // the configured matchers when present.
    let matchers = compile_matchers(verification.match_oidc_identity.as_deref())?;
    let mut certified = false;
    for layer in &layers {
        let Some(certificate) = layer.certificate_signature.as_ref() else {
            continue;
        };
        certified = true;
        if matchers.is_empty() {
            return Ok(VerifiedBy::Keyless);
        }
        let issuer = certificate.issuer.as_deref().unwrap_or_default();
        let subject = certificate_subject(&certificate.subject);
        if matchers
            .iter()
            .any(|matcher| matcher.matches(issuer, &subject))
        {
            return Ok(VerifiedBy::Keyless);
        }
    }

    if certified {
        NoMatchingIdentitySnafu { reference }.fail()
    } else {
        NoSignaturesSnafu { reference }.fail()
    }
}

fn certificate_subject(
    subject: &sigstore::cosign::signature_layers::CertificateSubject,
) -> String {
    use sigstore::cosign::signature_layers::CertificateSubject;
    match subject {
        CertificateSubject::Email(email) => email.clone(),
        CertificateSubject::Uri(uri) => uri.clone(),
    }
}

pub(crate) struct IdentityMatcher {
    issuer: Regex,
    subject: Regex,
}

impl IdentityMatcher {
    pub(crate) fn matches(&self, issuer: &str, subject: &str) -> bool {
        self.issuer.is_match(issuer) && self.subject.is_match(subject)
    }
}

pub(crate) fn compile_matchers(
    matchers: Option<&[OidcIdentityMatch]>,
) -> Result<Vec<IdentityMatcher>> {
    matchers
        .unwrap_or_default()
        .iter()
        .map(|matcher| {
            Ok(IdentityMatcher {
                issuer: Regex::new(&matcher.issuer).context(InvalidIdentityMatcherSnafu {
                    pattern: matcher.issuer.clone(),
                })?,
                subject: Regex::new(&matcher.subject).context(InvalidIdentityMatcherSnafu {
                    pattern: matcher.subject.clone(),
                })?,
            })
        })
        .collect()
}
