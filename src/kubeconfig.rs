use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::x509::X509;
use serde::Serialize;

use crate::catalog::{role, Identities};
use crate::cert::CertAndKey;
use crate::config::ClusterProperties;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct Kubeconfig<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'a str,
    clusters: Vec<Cluster<'a>>,
    contexts: Vec<Context<'a>>,
    #[serde(rename = "current-context")]
    current_context: &'a str,
    kind: &'a str,
    preferences: Preferences,
    users: Vec<User<'a>>,
}

#[derive(Debug, Serialize)]
struct Cluster<'a> {
    cluster: ClusterParameters<'a>,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ClusterParameters<'a> {
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
    server: &'a str,
}

#[derive(Debug, Serialize)]
struct Context<'a> {
    context: ContextParameters<'a>,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ContextParameters<'a> {
    cluster: &'a str,
    namespace: &'a str,
    user: &'a str,
}

#[derive(Debug, Serialize)]
struct Preferences {}

#[derive(Debug, Serialize)]
struct User<'a> {
    name: &'a str,
    user: UserParameters,
}

#[derive(Debug, Serialize)]
struct UserParameters {
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    client_key_data: String,
}

/// Which master address a bundle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Internal,
    External,
}

/// Where a bundle comes from and where it is written.
#[derive(Debug, Clone, Copy)]
pub struct BundleSpec {
    pub name: &'static str,
    pub ca_role: &'static str,
    pub client_role: &'static str,
    pub endpoint: Endpoint,
    pub path: &'static str,
}

/// Bundles written on the master.
pub const MASTER_BUNDLES: &[BundleSpec] = &[
    BundleSpec {
        name: "admin",
        ca_role: role::CA,
        client_role: role::ADMIN,
        endpoint: Endpoint::External,
        path: "etc/origin/master/admin.kubeconfig",
    },
    BundleSpec {
        name: "openshift-master",
        ca_role: role::CA,
        client_role: role::OPENSHIFT_MASTER,
        endpoint: Endpoint::Internal,
        path: "etc/origin/master/openshift-master.kubeconfig",
    },
    BundleSpec {
        name: "aggregator-front-proxy",
        ca_role: role::CA,
        client_role: role::AGGREGATOR_FRONT_PROXY,
        endpoint: Endpoint::Internal,
        path: "etc/origin/master/aggregator-front-proxy.kubeconfig",
    },
];

/// The bundle a node uses to request its own credentials.
pub const BOOTSTRAP_BUNDLE: BundleSpec = BundleSpec {
    name: "bootstrap",
    ca_role: role::CA,
    client_role: role::NODE_BOOTSTRAPPER,
    endpoint: Endpoint::Internal,
    path: "etc/origin/node/bootstrap.kubeconfig",
};

/// Cluster endpoint, trust anchor and client credentials for one principal.
///
/// Embeds a private key, so its serialized form is key material.
#[derive(Debug, Clone)]
pub struct AccessBundle {
    name: String,
    endpoint: String,
    ca_cert: X509,
    client: CertAndKey,
}

impl AccessBundle {
    /// Assembles a bundle from already issued identities.
    pub fn build(
        name: &str,
        endpoint: &str,
        identities: &Identities,
        ca_role: &str,
        client_role: &str,
    ) -> Result<Self> {
        let ca = identities.require(ca_role)?;
        let client = identities.require(client_role)?;
        Ok(AccessBundle {
            name: name.to_owned(),
            endpoint: endpoint.to_owned(),
            ca_cert: ca.cert().clone(),
            client: client.clone(),
        })
    }

    pub fn from_spec(spec: &BundleSpec, props: &ClusterProperties, identities: &Identities) -> Result<Self> {
        let endpoint = match spec.endpoint {
            Endpoint::Internal => props.internal_endpoint(),
            Endpoint::External => props.external_endpoint(),
        };
        Self::build(spec.name, &endpoint, identities, spec.ca_role, spec.client_role)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client(&self) -> &CertAndKey {
        &self.client
    }

    /// Kubeconfig cluster name, e.g. `cluster-master-0:8443`.
    fn cluster_name(&self) -> String {
        let host_port = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        host_port.replace('.', "-")
    }

    /// Serializes the bundle as a kubeconfig document.
    pub fn to_kubeconfig(&self) -> Result<Vec<u8>> {
        let cluster_name = self.cluster_name();
        let principal = self.client.common_name().unwrap_or_else(|| self.name.clone());
        let user_name = format!("{}/{}", principal, cluster_name);
        let context_name = format!("default/{}/{}", cluster_name, principal);

        let ca_pem = self.ca_cert.to_pem().map_err(|source| Error::Encoding {
            what: format!("CA certificate for bundle {}", self.name),
            source,
        })?;

        let kubeconfig = Kubeconfig {
            api_version: "v1",
            clusters: vec![Cluster {
                cluster: ClusterParameters {
                    certificate_authority_data: STANDARD.encode(ca_pem),
                    server: &self.endpoint,
                },
                name: &cluster_name,
            }],
            contexts: vec![Context {
                context: ContextParameters {
                    cluster: &cluster_name,
                    namespace: "default",
                    user: &user_name,
                },
                name: &context_name,
            }],
            current_context: &context_name,
            kind: "Config",
            preferences: Preferences {},
            users: vec![User {
                name: &user_name,
                user: UserParameters {
                    client_certificate_data: STANDARD.encode(self.client.cert_pem()?),
                    client_key_data: STANDARD.encode(self.client.key_pem()?),
                },
            }],
        };

        serde_yaml::to_string(&kubeconfig)
            .map(String::into_bytes)
            .map_err(|source| Error::Kubeconfig {
                name: self.name.clone(),
                source,
            })
    }
}
