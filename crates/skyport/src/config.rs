use serde::Deserialize;
use skyport_http::{
    Auth, AwsCredentials, AzureCredentials, CatalogSelector, KeystoneCredentials, KeystoneSecret,
};

use crate::{Error, ProviderName, Result, Service};

const RACKSPACE_AUTH_URL: &str = "https://identity.api.rackspacecloud.com";
const AZURE_MANAGEMENT_URL: &str = "https://management.azure.com";
const REDISTOGO_URL: &str = "https://redistogo.com";
const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Everything needed to build a [`crate::Client`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub provider: ProviderName,
    pub service: Service,
    /// Service base URL; request paths are joined onto it. Keystone
    /// providers may leave it empty to use the service catalog's URL.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub region: Option<String>,
    /// Azure only.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Azure only.
    #[serde(default)]
    pub resource_group: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    #[default]
    None,
    Token {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Keystone {
        auth_url: String,
        username: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
    },
    Azure {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    Aws {
        access_key_id: String,
        secret_access_key: String,
    },
    Redistogo {
        api_token: String,
    },
}

impl Credentials {
    pub(crate) fn to_auth(&self) -> Result<Auth> {
        Ok(match self.clone() {
            Self::None => Auth::None,
            Self::Token { token } => Auth::Bearer(token),
            Self::Basic { username, password } => Auth::Basic { username, password },
            Self::Keystone {
                auth_url,
                username,
                api_key,
                password,
                tenant_id,
            } => {
                let secret = match (api_key, password) {
                    (Some(key), _) => KeystoneSecret::ApiKey(key),
                    (None, Some(password)) => KeystoneSecret::Password(password),
                    (None, None) => {
                        return Err(Error::Validation {
                            field: "credentials",
                            reason: "keystone needs an api_key or a password".into(),
                        });
                    }
                };
                Auth::Keystone(KeystoneCredentials {
                    auth_url,
                    username,
                    secret,
                    tenant_id,
                    catalog: None,
                })
            }
            Self::Azure {
                tenant_id,
                client_id,
                client_secret,
            } => Auth::AzureAd(AzureCredentials {
                tenant_id,
                client_id,
                client_secret,
                authority: None,
            }),
            Self::Aws {
                access_key_id,
                secret_access_key,
            } => Auth::AwsQuery(AwsCredentials {
                access_key_id,
                secret_access_key,
            }),
            Self::Redistogo { api_token } => Auth::Header {
                name: "Authorization".into(),
                value: format!("Token token=\"{api_token}\""),
            },
        })
    }
}

impl ClientConfig {
    pub fn new(provider: ProviderName, service: Service, endpoint: impl Into<String>) -> Self {
        Self {
            provider,
            service,
            endpoint: endpoint.into(),
            credentials: Credentials::None,
            region: None,
            subscription_id: None,
            resource_group: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Transport authentication for this provider and service. Amazon
    /// storage signs S3-style; Keystone sessions look up this service in
    /// the catalog.
    pub(crate) fn auth(&self) -> Result<Auth> {
        Ok(match self.credentials.to_auth()? {
            Auth::AwsQuery(credentials) if self.service == Service::Storage => Auth::AwsS3 {
                credentials,
                region: self.region.clone().unwrap_or_else(|| DEFAULT_AWS_REGION.into()),
            },
            Auth::Keystone(mut creds) => {
                creds.catalog = Some(CatalogSelector {
                    service_type: catalog_type(self.provider, self.service).into(),
                    region: self.region.clone(),
                });
                Auth::Keystone(creds)
            }
            auth => auth,
        })
    }

    /// Read the provider's variables from the process environment,
    /// loading `.env` first if there is one.
    pub fn from_env(provider: ProviderName, service: Service) -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(provider, service, |key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(provider: ProviderName, service: Service, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| optional(key).ok_or_else(|| Error::MissingEnv(key.into()));

        let credentials = match provider {
            ProviderName::Rackspace => Credentials::Keystone {
                auth_url: optional("RACKSPACE_AUTH_URL").unwrap_or_else(|| RACKSPACE_AUTH_URL.into()),
                username: required("RACKSPACE_USERNAME")?,
                api_key: Some(required("RACKSPACE_API_KEY")?),
                password: None,
                tenant_id: None,
            },
            ProviderName::Openstack => Credentials::Keystone {
                auth_url: required("OPENSTACK_AUTH_URL")?,
                username: required("OPENSTACK_USERNAME")?,
                api_key: None,
                password: Some(required("OPENSTACK_PASSWORD")?),
                tenant_id: optional("OPENSTACK_TENANT_ID"),
            },
            ProviderName::Amazon => Credentials::Aws {
                access_key_id: required("AWS_ACCESS_KEY_ID")?,
                secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            },
            ProviderName::Azure => Credentials::Azure {
                tenant_id: required("AZURE_TENANT_ID")?,
                client_id: required("AZURE_CLIENT_ID")?,
                client_secret: required("AZURE_CLIENT_SECRET")?,
            },
            ProviderName::Joyent => Credentials::Basic {
                username: required("JOYENT_USERNAME")?,
                password: required("JOYENT_PASSWORD")?,
            },
            ProviderName::Redistogo => Credentials::Redistogo {
                api_token: required("REDISTOGO_API_TOKEN")?,
            },
        };

        let (subscription_id, resource_group) = match provider {
            ProviderName::Azure => (
                Some(required("AZURE_SUBSCRIPTION_ID")?),
                Some(required("AZURE_RESOURCE_GROUP")?),
            ),
            _ => (None, None),
        };

        let region = match provider {
            ProviderName::Amazon => optional("AWS_REGION"),
            ProviderName::Joyent => optional("JOYENT_REGION"),
            _ => optional("SKYPORT_REGION"),
        };

        let endpoint = optional("SKYPORT_ENDPOINT")
            .or_else(|| default_endpoint(provider, service, region.as_deref()))
            .unwrap_or_default();

        Ok(Self {
            provider,
            service,
            endpoint,
            credentials,
            region,
            subscription_id,
            resource_group,
        })
    }
}

/// Keystone service catalog `type` for a service.
fn catalog_type(provider: ProviderName, service: Service) -> &'static str {
    match (provider, service) {
        (_, Service::Compute) => "compute",
        (_, Service::Storage) => "object-store",
        (ProviderName::Rackspace, Service::Database) => "rax:database",
        (ProviderName::Rackspace, Service::Network) => "rax:load-balancer",
        (_, Service::Database) => "database",
        (_, Service::Network) => "network",
    }
}

/// Public endpoint for providers that have a fixed one. Keystone-based
/// providers publish theirs in the service catalog instead.
fn default_endpoint(provider: ProviderName, service: Service, region: Option<&str>) -> Option<String> {
    match (provider, service) {
        (ProviderName::Amazon, Service::Compute) => Some(format!(
            "https://ec2.{}.amazonaws.com",
            region.unwrap_or(DEFAULT_AWS_REGION)
        )),
        (ProviderName::Amazon, Service::Storage) => Some(match region {
            Some(region) => format!("https://s3.{region}.amazonaws.com"),
            None => "https://s3.amazonaws.com".into(),
        }),
        (ProviderName::Azure, _) => Some(AZURE_MANAGEMENT_URL.into()),
        (ProviderName::Joyent, _) => Some(format!(
            "https://{}.api.joyentcloud.com",
            region.unwrap_or(DEFAULT_AWS_REGION)
        )),
        (ProviderName::Redistogo, _) => Some(REDISTOGO_URL.into()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn rackspace_reads_keystone_credentials() {
        let config = ClientConfig::from_lookup(
            ProviderName::Rackspace,
            Service::Storage,
            env(&[
                ("RACKSPACE_USERNAME", "MOCK-USERNAME"),
                ("RACKSPACE_API_KEY", "MOCK-API-KEY"),
                ("SKYPORT_ENDPOINT", "https://storage101.dfw1.clouddrive.com/v1/acct"),
            ]),
        )
        .unwrap();

        assert_eq!(config.endpoint, "https://storage101.dfw1.clouddrive.com/v1/acct");
        match config.credentials.to_auth().unwrap() {
            Auth::Keystone(creds) => {
                assert_eq!(creds.auth_url, RACKSPACE_AUTH_URL);
                assert!(matches!(creds.secret, KeystoneSecret::ApiKey(k) if k == "MOCK-API-KEY"));
            }
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn keystone_endpoint_comes_from_the_catalog() {
        let config = ClientConfig::from_lookup(
            ProviderName::Rackspace,
            Service::Database,
            env(&[("RACKSPACE_USERNAME", "u"), ("RACKSPACE_API_KEY", "k"), ("SKYPORT_REGION", "ORD")]),
        )
        .unwrap();
        assert_eq!(config.endpoint, "");

        match config.auth().unwrap() {
            Auth::Keystone(creds) => {
                let catalog = creds.catalog.unwrap();
                assert_eq!(catalog.service_type, "rax:database");
                assert_eq!(catalog.region.as_deref(), Some("ORD"));
            }
            other => panic!("unexpected auth {other:?}"),
        }

        let openstack = ClientConfig::new(ProviderName::Openstack, Service::Storage, "").with_credentials(
            Credentials::Keystone {
                auth_url: "https://keystone".into(),
                username: "u".into(),
                api_key: None,
                password: Some("p".into()),
                tenant_id: None,
            },
        );
        match openstack.auth().unwrap() {
            Auth::Keystone(creds) => assert_eq!(creds.catalog.unwrap().service_type, "object-store"),
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn amazon_storage_signs_for_s3() {
        let creds = Credentials::Aws {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
        };

        let s3 = ClientConfig::new(ProviderName::Amazon, Service::Storage, "https://s3.amazonaws.com")
            .with_credentials(creds.clone());
        match s3.auth().unwrap() {
            Auth::AwsS3 { credentials, region } => {
                assert_eq!(credentials.access_key_id, "AKID");
                assert_eq!(region, "us-east-1");
            }
            other => panic!("unexpected auth {other:?}"),
        }

        let s3 = s3.with_region("eu-west-1");
        assert!(matches!(s3.auth().unwrap(), Auth::AwsS3 { region, .. } if region == "eu-west-1"));

        let ec2 = ClientConfig::new(ProviderName::Amazon, Service::Compute, "https://ec2.us-east-1.amazonaws.com")
            .with_credentials(creds);
        assert!(matches!(ec2.auth().unwrap(), Auth::AwsQuery(_)));
    }

    #[test]
    fn missing_required_variable_is_named() {
        let err = ClientConfig::from_lookup(
            ProviderName::Azure,
            Service::Compute,
            env(&[("AZURE_TENANT_ID", "t"), ("AZURE_CLIENT_ID", "c"), ("AZURE_CLIENT_SECRET", "s")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingEnv(v) if v == "AZURE_SUBSCRIPTION_ID"));
    }

    #[test]
    fn amazon_endpoint_follows_region() {
        let config = ClientConfig::from_lookup(
            ProviderName::Amazon,
            Service::Compute,
            env(&[
                ("AWS_ACCESS_KEY_ID", "AKID"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("AWS_REGION", "eu-west-1"),
            ]),
        )
        .unwrap();
        assert_eq!(config.endpoint, "https://ec2.eu-west-1.amazonaws.com");
    }

    #[test]
    fn redistogo_token_becomes_authorization_header() {
        let creds = Credentials::Redistogo {
            api_token: "abc".into(),
        };
        match creds.to_auth().unwrap() {
            Auth::Header { name, value } => {
                assert_eq!(name, "Authorization");
                assert_eq!(value, "Token token=\"abc\"");
            }
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn keystone_without_secret_is_invalid() {
        let creds = Credentials::Keystone {
            auth_url: "https://id".into(),
            username: "u".into(),
            api_key: None,
            password: None,
            tenant_id: None,
        };
        assert!(matches!(creds.to_auth(), Err(Error::Validation { field: "credentials", .. })));
    }

    #[test]
    fn deserializes_tagged_credentials() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "provider": "joyent",
            "service": "compute",
            "endpoint": "https://us-sw-1.api.joyentcloud.com",
            "credentials": { "type": "basic", "username": "u", "password": "p" }
        }))
        .unwrap();
        assert_eq!(config.provider, ProviderName::Joyent);
        assert!(matches!(config.credentials, Credentials::Basic { .. }));
        assert_eq!(config.region, None);
    }
}
