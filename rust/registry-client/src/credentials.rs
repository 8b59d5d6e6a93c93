//! Registry credential resolution.
//!
//! Credentials are resolved in priority order: the explicit secret named
//! by the spec, image pull secrets of a referenced service account, a
//! cloud provider login for non-generic providers, and finally anonymous.
//! An unconfigured cloud provider is not fatal; it falls through to
//! anonymous access.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Api, Client};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, warn};

use source_operator_crd::RegistryProvider;

use crate::TlsMaterial;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to get secret {}: {}", name, source))]
    SecretNotFound { name: String, source: kube::Error },

    #[snafu(display("Failed to get service account {}: {}", name, source))]
    ServiceAccountNotFound { name: String, source: kube::Error },

    #[snafu(display("Secret {} has no usable credential entries", name))]
    MalformedSecret { name: String },

    #[snafu(display("Secret {} holds a malformed docker config: {}", name, source))]
    MalformedDockerConfig {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to decode base64 auth entry: {}", source))]
    MalformedAuthEntry { source: base64::DecodeError },

    #[snafu(display("Unconfigured provider {:?}", provider))]
    UnconfiguredProvider { provider: RegistryProvider },

    #[snafu(display("Failed to stage credential file: {}", source))]
    CredentialFile { source: std::io::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Scoped handle around an ephemeral credential file. The file is deleted
/// when the handle drops, on every exit path of a reconciliation.
#[derive(Debug)]
pub struct CredentialFile {
    file: tempfile::NamedTempFile,
}

impl CredentialFile {
    fn stage(contents: &[u8]) -> Result<Self> {
        let mut file = tempfile::NamedTempFile::new().context(CredentialFileSnafu)?;
        file.write_all(contents).context(CredentialFileSnafu)?;
        file.flush().context(CredentialFileSnafu)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// The outcome of credential resolution: the authenticator for registry
/// operations and, for flows that materialize one, a scoped credential
/// file.
#[derive(Debug, Default)]
pub struct RegistryLogin {
    pub auth: Auth,
    pub credential_file: Option<CredentialFile>,
}

/// Owned mirror of [`RegistryAuth`]; the upstream type is neither `Clone`
/// nor `Debug`.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Auth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
}

impl Auth {
    pub fn to_registry_auth(&self) -> RegistryAuth {
        match self {
            Auth::Anonymous => RegistryAuth::Anonymous,
            Auth::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Auth::Anonymous)
    }
}

/// Cloud provider seam for OIDC auto-login. The builtin implementations
/// are unconfigured placeholders; deployments wire real helpers in here.
#[async_trait]
pub trait CloudCredentialProvider: Send + Sync {
    async fn login(&self, registry: &str) -> Result<Auth>;
}

/// Default provider used for `aws`, `azure` and `gcp` until a real helper
/// is configured. Always reports [`Error::UnconfiguredProvider`], which
/// resolution treats as a fall-through, not a failure.
pub struct UnconfiguredCloudProvider {
    provider: RegistryProvider,
}

impl UnconfiguredCloudProvider {
    pub fn new(provider: RegistryProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl CloudCredentialProvider for UnconfiguredCloudProvider {
    async fn login(&self, _registry: &str) -> Result<Auth> {
        UnconfiguredProviderSnafu {
            provider: self.provider,
        }
        .fail()
    }
}

pub struct CredentialResolver {
    client: Client,
    cloud_provider: Box<dyn CloudCredentialProvider>,
}

impl CredentialResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cloud_provider: Box::new(UnconfiguredCloudProvider::new(RegistryProvider::Generic)),
        }
    }

    pub fn with_cloud_provider(
        client: Client,
        cloud_provider: Box<dyn CloudCredentialProvider>,
    ) -> Self {
        Self {
            client,
            cloud_provider,
        }
    }

    /// Resolves registry credentials for one reconciliation.
    pub async fn resolve(
        &self,
        namespace: &str,
        secret_name: Option<&str>,
        service_account_name: Option<&str>,
        provider: RegistryProvider,
        registry: &str,
    ) -> Result<RegistryLogin> {
        if let Some(name) = secret_name {
            let secret = self.get_secret(namespace, name).await?;
            return login_from_secret(&secret, name, registry);
        }

        if let Some(name) = service_account_name {
            let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
            let account = api
                .get(name)
                .await
                .context(ServiceAccountNotFoundSnafu { name })?;
            for pull_secret in account.image_pull_secrets.unwrap_or_default() {
                let secret_name = pull_secret.name;
                if secret_name.is_empty() {
                    continue;
                }
                let secret = self.get_secret(namespace, &secret_name).await?;
                match login_from_secret(&secret, &secret_name, registry) {
                    Ok(login) if !login.auth.is_anonymous() => return Ok(login),
                    Ok(_) => continue,
                    Err(error) => {
                        debug!("Skipping pull secret {}: {}", secret_name, error);
                        continue;
                    }
                }
            }
        }

        if provider != RegistryProvider::Generic {
            match self.cloud_provider.login(registry).await {
                Ok(auth) => {
                    return Ok(RegistryLogin {
                        auth,
                        credential_file: None,
                    })
                }
                Err(Error::UnconfiguredProvider { provider }) => {
                    warn!(
                        "Provider {:?} is not configured, continuing anonymously",
                        provider
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Ok(RegistryLogin::default())
    }

    /// Reads TLS material from a cert secret.
    pub async fn resolve_tls(&self, namespace: &str, secret_name: &str) -> Result<TlsMaterial> {
        let secret = self.get_secret(namespace, secret_name).await?;
        let data = secret_data(&secret);
        Ok(TlsMaterial {
            ca_certificate: data.get("ca.crt").cloned(),
            client_certificate: data.get("tls.crt").cloned(),
            client_key: data.get("tls.key").cloned(),
        })
    }

    /// Reads the candidate verification keys from a secret: every entry
    /// whose name ends in `.pub`.
    pub async fn resolve_verification_keys(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let secret = self.get_secret(namespace, secret_name).await?;
        Ok(secret_data(&secret)
            .into_iter()
            .filter(|(name, _)| name.ends_with(".pub"))
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.context(SecretNotFoundSnafu { name })
    }
}

/// Builds a login from a credential secret: either a
/// `kubernetes.io/dockerconfigjson` payload or plain `username`/`password`
/// entries. Docker configs are additionally staged to a scoped credential
/// file for tooling that reads configs from disk.
pub fn login_from_secret(secret: &Secret, name: &str, registry: &str) -> Result<RegistryLogin> {
    let data = secret_data(secret);

    if let Some(config) = data.get(".dockerconfigjson") {
        let auth = auth_from_docker_config(config, registry, name)?
            .context(MalformedSecretSnafu { name })?;
        return Ok(RegistryLogin {
            auth,
            credential_file: Some(CredentialFile::stage(config)?),
        });
    }

    match (data.get("username"), data.get("password")) {
        (Some(username), Some(password)) => Ok(RegistryLogin {
            auth: Auth::Basic {
                username: String::from_utf8_lossy(username).into_owned(),
                password: String::from_utf8_lossy(password).into_owned(),
            },
            credential_file: None,
        }),
        _ => MalformedSecretSnafu { name }.fail(),
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

/// Picks the auth entry matching the registry host from a docker config.
pub fn auth_from_docker_config(
    config: &[u8],
    registry: &str,
    secret_name: &str,
) -> Result<Option<Auth>> {
    let config: DockerConfig = serde_json::from_slice(config).context(MalformedDockerConfigSnafu {
        name: secret_name,
    })?;

    for (host, entry) in &config.auths {
        if !host_matches(host, registry) {
            continue;
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            }));
        }
        if let Some(encoded) = &entry.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context(MalformedAuthEntrySnafu)?;
            let decoded = String::from_utf8_lossy(&decoded);
            if let Some((username, password)) = decoded.split_once(':') {
                return Ok(Some(Auth::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                }));
            }
        }
    }
    Ok(None)
}

/// Docker config hosts may carry a scheme or path suffix.
fn host_matches(entry: &str, registry: &str) -> bool {
    let normalized = entry
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let normalized = normalized.split('/').next().unwrap_or(normalized);
    normalized == registry
}

fn secret_data(secret: &Secret) -> BTreeMap<String, Vec<u8>> {
    let mut data: BTreeMap<String, Vec<u8>> = secret
        .data
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, value.0))
        .collect();
    for (key, value) in secret.string_data.clone().unwrap_or_default() {
        data.entry(key).or_insert_with(|| value.into_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn secret_with_data(entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(key, value)| (key.to_string(), ByteString(value.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn docker_config_with_plain_credentials() {
        let config = br#"{"auths":{"ghcr.io":{"username":"robot","password":"hunter2"}}}"#;
        let auth = auth_from_docker_config(config, "ghcr.io", "creds")
            .unwrap()
            .unwrap();
        assert_eq!(
            auth,
            Auth::Basic {
                username: "robot".into(),
                password: "hunter2".into()
            }
        );
    }

    #[test]
    fn docker_config_with_encoded_auth() {
        // base64("robot:hunter2")
        let config = br#"{"auths":{"https://ghcr.io/v1/":{"auth":"cm9ib3Q6aHVudGVyMg=="}}}"#;
        let auth = auth_from_docker_config(config, "ghcr.io", "creds")
            .unwrap()
            .unwrap();
        assert_eq!(
            auth,
            Auth::Basic {
                username: "robot".into(),
                password: "hunter2".into()
            }
        );
    }

    #[test]
    fn docker_config_without_matching_host() {
        let config = br#"{"auths":{"docker.io":{"auth":"cm9ib3Q6aHVudGVyMg=="}}}"#;
        assert_eq!(
            auth_from_docker_config(config, "ghcr.io", "creds").unwrap(),
            None
        );
    }

    #[test]
    fn malformed_docker_config_is_reported() {
        let error = auth_from_docker_config(b"not json", "ghcr.io", "creds").unwrap_err();
        assert!(matches!(error, Error::MalformedDockerConfig { .. }));
    }

    #[test]
    fn basic_auth_secret_resolves() {
        let secret = secret_with_data(&[("username", b"robot"), ("password", b"hunter2")]);
        let login = login_from_secret(&secret, "creds", "ghcr.io").unwrap();
        assert!(!login.auth.is_anonymous());
        assert!(login.credential_file.is_none());
    }

    #[test]
    fn docker_config_secret_stages_credential_file() {
        let secret = secret_with_data(&[(
            ".dockerconfigjson",
            br#"{"auths":{"ghcr.io":{"username":"robot","password":"hunter2"}}}"#.as_slice(),
        )]);
        let login = login_from_secret(&secret, "creds", "ghcr.io").unwrap();
        let file = login.credential_file.expect("credential file staged");
        let path = file.path().to_path_buf();
        assert!(path.is_file());

        // The scoped handle removes the file on drop.
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn secret_without_credentials_is_malformed() {
        let secret = secret_with_data(&[("token", b"abc")]);
        let error = login_from_secret(&secret, "creds", "ghcr.io").unwrap_err();
        assert!(matches!(error, Error::MalformedSecret { .. }));
    }

    #[tokio::test]
    async fn unconfigured_provider_reports_fall_through() {
        let provider = UnconfiguredCloudProvider::new(RegistryProvider::Aws);
        let error = provider.login("123.dkr.ecr.example").await.unwrap_err();
        assert!(matches!(error, Error::UnconfiguredProvider { .. }));
    }
}
