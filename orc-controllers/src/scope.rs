//! Building [`Clients`] from a `clouds.yaml` credentials secret
//!
//! The secret holds a `clouds.yaml` document under the key `clouds.yaml`; the object selects one
//! of its clouds with `spec.cloudCredentialsRef.cloudName`. Turning the selected profile into
//! authenticated clients is the job of a [`Connector`].
use crate::osclients::{mock::MockCloud, Clients};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use orc_runtime::{ScopeError, ScopeFactory};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The key of the credentials secret holding `clouds.yaml`
pub const CLOUDS_YAML_KEY: &str = "clouds.yaml";

#[derive(Clone, Debug, Default, Deserialize)]
struct CloudsYaml {
    #[serde(default)]
    clouds: BTreeMap<String, CloudProfile>,
}

/// One cloud of a `clouds.yaml` document
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CloudProfile {
    #[serde(default)]
    pub auth: Option<Auth>,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub identity_api_version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub verify: Option<bool>,
    #[serde(default)]
    pub cacert: Option<String>,
}

/// The `auth` section of a cloud profile
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Auth {
    pub auth_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub user_domain_name: Option<String>,
    #[serde(default)]
    pub project_domain_name: Option<String>,
    #[serde(default)]
    pub application_credential_id: Option<String>,
    #[serde(default)]
    pub application_credential_secret: Option<String>,
}

/// Select the profile of `cloud_name` from the `clouds.yaml` in `secret`
pub fn profile(secret: &Secret, cloud_name: &str) -> Result<CloudProfile, ScopeError> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(CLOUDS_YAML_KEY))
        .map(|raw| raw.0.as_slice())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(CLOUDS_YAML_KEY))
                .map(|raw| raw.as_bytes())
        })
        .ok_or_else(|| ScopeError::MissingKey(CLOUDS_YAML_KEY.into()))?;
    let mut document: CloudsYaml =
        serde_yaml::from_slice(raw).map_err(|err| ScopeError::Malformed(err.to_string()))?;
    let profile = document
        .clouds
        .remove(cloud_name)
        .ok_or_else(|| ScopeError::UnknownCloud(cloud_name.into()))?;
    if profile.auth.as_ref().is_none_or(|auth| auth.auth_url.is_empty()) {
        return Err(ScopeError::Malformed(format!("cloud {cloud_name:?} has no auth.auth_url")));
    }
    Ok(profile)
}

/// Authenticates against a cloud profile
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Clients for `profile`, whose calls fail once `cancel` is cancelled
    async fn connect(
        &self,
        cloud_name: &str,
        profile: &CloudProfile,
        cancel: CancellationToken,
    ) -> Result<Clients, ScopeError>;
}

/// A [`ScopeFactory`] reading `clouds.yaml` credentials secrets
pub struct CloudsYamlScopes<C> {
    connector: Arc<C>,
}

impl<C> Clone for CloudsYamlScopes<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
        }
    }
}

impl<C: Connector> CloudsYamlScopes<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
        }
    }
}

#[async_trait]
impl<C: Connector> ScopeFactory for CloudsYamlScopes<C> {
    type Scope = Clients;

    async fn new_scope(
        &self,
        credentials: &Secret,
        cloud_name: &str,
        cancel: CancellationToken,
    ) -> Result<Clients, ScopeError> {
        let profile = profile(credentials, cloud_name)?;
        debug!(
            cloud = cloud_name,
            region = profile.region_name.as_deref().unwrap_or_default(),
            "connecting to cloud"
        );
        self.connector.connect(cloud_name, &profile, cancel).await
    }
}

/// Serves every cloud profile from one [`MockCloud`]
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    cloud: MockCloud,
}

impl InMemoryConnector {
    pub fn new(cloud: MockCloud) -> Self {
        Self { cloud }
    }

    pub fn cloud(&self) -> &MockCloud {
        &self.cloud
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(
        &self,
        _cloud_name: &str,
        _profile: &CloudProfile,
        cancel: CancellationToken,
    ) -> Result<Clients, ScopeError> {
        Ok(Clients::from_cloud(self.cloud.with_cancel(cancel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use orc_core::CloudError;

    fn secret(clouds_yaml: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                CLOUDS_YAML_KEY.to_string(),
                ByteString(clouds_yaml.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        }
    }

    const CLOUDS: &str = r#"
clouds:
  openstack:
    auth:
      auth_url: https://keystone.example:5000/v3
      application_credential_id: abc
      application_credential_secret: s3cr3t
    region_name: RegionOne
    identity_api_version: 3
  broken:
    region_name: RegionTwo
"#;

    #[test]
    fn selects_the_named_cloud() {
        let profile = profile(&secret(CLOUDS), "openstack").unwrap();
        assert_eq!(profile.region_name.as_deref(), Some("RegionOne"));
        assert_eq!(
            profile.auth.unwrap().application_credential_id.as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn reports_what_is_wrong_with_the_secret() {
        assert!(matches!(profile(&Secret::default(), "openstack"), Err(ScopeError::MissingKey(_))));
        assert!(matches!(profile(&secret("clouds: ["), "openstack"), Err(ScopeError::Malformed(_))));
        assert!(matches!(profile(&secret(CLOUDS), "other"), Err(ScopeError::UnknownCloud(name)) if name == "other"));
        assert!(matches!(profile(&secret(CLOUDS), "broken"), Err(ScopeError::Malformed(_))));
    }

    #[test]
    fn string_data_is_accepted() {
        let secret = Secret {
            string_data: Some(BTreeMap::from([(CLOUDS_YAML_KEY.to_string(), CLOUDS.to_string())])),
            ..Secret::default()
        };
        assert!(profile(&secret, "openstack").is_ok());
    }

    #[tokio::test]
    async fn scopes_stop_working_once_cancelled() {
        let connector = InMemoryConnector::default();
        let scopes = CloudsYamlScopes::new(connector.clone());
        let cancel = CancellationToken::new();
        let clients = scopes.new_scope(&secret(CLOUDS), "openstack", cancel.clone()).await.unwrap();
        assert!(clients.networking.get_network("missing").await.unwrap_err().is_not_found());

        cancel.cancel();
        assert_eq!(clients.networking.get_network("missing").await.unwrap_err(), CloudError::Cancelled);
        assert_eq!(connector.cloud().calls("get_network"), 1);
    }
}
