//! The fixed set of identities a cluster needs, and their materialization
//! into certificates.
//!
//! Descriptors are ordered: a signer must appear before anything it signs.
//! Only self-signed roots may sign, which keeps every chain at most two
//! levels deep.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, info};

use crate::cert::{CertAndKey, CertificateAuthority, Profile, San, Subject};
use crate::config::ClusterProperties;
use crate::error::{Error, Result};

/// Role names of the default catalog.
pub mod role {
    pub const CA: &str = "ca";
    pub const FRONT_PROXY_CA: &str = "frontproxy-ca";
    pub const ETCD_CA: &str = "master.etcd-ca";
    pub const SERVICE_SIGNER: &str = "service-signer";
    pub const ETCD_SERVER: &str = "etcd-server";
    pub const ETCD_PEER: &str = "etcd-peer";
    pub const MASTER_ETCD_CLIENT: &str = "master.etcd-client";
    pub const MASTER_SERVER: &str = "master.server";
    pub const KUBELET_CLIENT: &str = "master.kubelet-client";
    pub const PROXY_CLIENT: &str = "master.proxy-client";
    pub const OPENSHIFT_MASTER: &str = "openshift-master";
    pub const ADMIN: &str = "admin";
    pub const AGGREGATOR_FRONT_PROXY: &str = "aggregator-front-proxy";
    pub const NODE_BOOTSTRAPPER: &str = "node-bootstrapper";
}

/// A subject or SAN value, possibly taken from the cluster properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Literal(&'static str),
    MasterHostname,
    ExternalHostname,
    /// Every master IP; as a common name, the first one.
    MasterIps,
}

impl Template {
    fn values(self, props: &ClusterProperties) -> Vec<String> {
        match self {
            Template::Literal(value) => vec![value.to_owned()],
            Template::MasterHostname => vec![props.master_hostname.clone()],
            Template::ExternalHostname => vec![props.external_hostname().to_owned()],
            Template::MasterIps => props.master_ips.iter().map(|ip| ip.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signer {
    /// A root CA. Self-signed entries are always issued with the CA profile.
    SelfSigned,
    Role(&'static str),
}

/// Declarative description of one certificate to issue.
#[derive(Debug, Clone, Copy)]
pub struct IdentityDescriptor {
    pub role: &'static str,
    pub common_name: Template,
    pub organizations: &'static [&'static str],
    pub sans: &'static [Template],
    pub profile: Profile,
    pub signer: Signer,
    /// Path stem of the `.crt`/`.key` pair on the master, if written there.
    pub path: Option<&'static str>,
}

impl IdentityDescriptor {
    const fn root(role: &'static str, common_name: &'static str, path: &'static str) -> Self {
        IdentityDescriptor {
            role,
            common_name: Template::Literal(common_name),
            organizations: &[],
            sans: &[],
            profile: Profile::Ca,
            signer: Signer::SelfSigned,
            path: Some(path),
        }
    }

    pub fn subject(&self, props: &ClusterProperties) -> Subject {
        let common_name = self
            .common_name
            .values(props)
            .into_iter()
            .next()
            .unwrap_or_default();
        self.organizations
            .iter()
            .fold(Subject::new(common_name), |subject, org| subject.organization(*org))
    }

    pub fn resolve_sans(&self, props: &ClusterProperties) -> Vec<San> {
        let mut sans = Vec::new();
        for value in self.sans.iter().flat_map(|t| t.values(props)) {
            let san = San::classify(&value);
            if !sans.contains(&san) {
                sans.push(san);
            }
        }
        sans
    }
}

const MASTER_SERVER_SANS: &[Template] = &[
    Template::MasterHostname,
    Template::ExternalHostname,
    Template::MasterIps,
    Template::Literal("kubernetes"),
    Template::Literal("kubernetes.default"),
    Template::Literal("kubernetes.default.svc"),
    Template::Literal("kubernetes.default.svc.cluster.local"),
    Template::Literal("openshift"),
    Template::Literal("openshift.default"),
    Template::Literal("openshift.default.svc"),
    Template::Literal("openshift.default.svc.cluster.local"),
    Template::Literal("172.30.0.1"),
];

const ETCD_SANS: &[Template] = &[Template::MasterHostname, Template::MasterIps];

const CLUSTER_ADMINS: &[&str] = &["system:cluster-admins", "system:masters"];

/// Everything a master needs, in issuing order.
pub const DEFAULT_CATALOG: &[IdentityDescriptor] = &[
    IdentityDescriptor::root(role::CA, "openshift-signer", "etc/origin/master/ca"),
    IdentityDescriptor::root(
        role::FRONT_PROXY_CA,
        "openshift-frontproxy-signer",
        "etc/origin/master/frontproxy-ca",
    ),
    IdentityDescriptor::root(role::ETCD_CA, "etcd-signer", "etc/origin/master/master.etcd-ca"),
    IdentityDescriptor::root(
        role::SERVICE_SIGNER,
        "openshift-service-serving-signer",
        "etc/origin/master/service-signer",
    ),
    IdentityDescriptor {
        role: role::ETCD_SERVER,
        common_name: Template::MasterHostname,
        organizations: &[],
        sans: ETCD_SANS,
        profile: Profile::Server,
        signer: Signer::Role(role::ETCD_CA),
        path: Some("etc/etcd/server"),
    },
    IdentityDescriptor {
        role: role::ETCD_PEER,
        common_name: Template::MasterHostname,
        organizations: &[],
        sans: ETCD_SANS,
        profile: Profile::Peer,
        signer: Signer::Role(role::ETCD_CA),
        path: Some("etc/etcd/peer"),
    },
    IdentityDescriptor {
        role: role::MASTER_ETCD_CLIENT,
        common_name: Template::MasterHostname,
        organizations: &[],
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::ETCD_CA),
        path: Some("etc/origin/master/master.etcd-client"),
    },
    IdentityDescriptor {
        role: role::MASTER_SERVER,
        common_name: Template::MasterHostname,
        organizations: &[],
        sans: MASTER_SERVER_SANS,
        profile: Profile::Server,
        signer: Signer::Role(role::CA),
        path: Some("etc/origin/master/master.server"),
    },
    IdentityDescriptor {
        role: role::KUBELET_CLIENT,
        common_name: Template::Literal("system:openshift-node-admin"),
        organizations: &["system:node-admins"],
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::CA),
        path: Some("etc/origin/master/master.kubelet-client"),
    },
    IdentityDescriptor {
        role: role::PROXY_CLIENT,
        common_name: Template::Literal("system:master-proxy"),
        organizations: &[],
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::CA),
        path: Some("etc/origin/master/master.proxy-client"),
    },
    IdentityDescriptor {
        role: role::OPENSHIFT_MASTER,
        common_name: Template::Literal("system:openshift-master"),
        organizations: CLUSTER_ADMINS,
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::CA),
        path: Some("etc/origin/master/openshift-master"),
    },
    IdentityDescriptor {
        role: role::ADMIN,
        common_name: Template::Literal("system:admin"),
        organizations: CLUSTER_ADMINS,
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::CA),
        path: Some("etc/origin/master/admin"),
    },
    IdentityDescriptor {
        role: role::AGGREGATOR_FRONT_PROXY,
        common_name: Template::Literal("aggregator-front-proxy"),
        organizations: &[],
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::FRONT_PROXY_CA),
        path: Some("etc/origin/master/aggregator-front-proxy"),
    },
    IdentityDescriptor {
        role: role::NODE_BOOTSTRAPPER,
        common_name: Template::Literal("system:serviceaccount:openshift-infra:node-bootstrapper"),
        organizations: &[],
        sans: &[],
        profile: Profile::Client,
        signer: Signer::Role(role::CA),
        path: None,
    },
];

/// Issued records keyed by role. Each role is inserted once and never replaced.
#[derive(Debug, Default)]
pub struct Identities {
    records: BTreeMap<String, CertAndKey>,
}

impl Identities {
    pub fn get(&self, role: &str) -> Option<&CertAndKey> {
        self.records.get(role)
    }

    pub fn require(&self, role: &str) -> Result<&CertAndKey> {
        self.get(role)
            .ok_or_else(|| Error::MissingIdentity(role.to_owned()))
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, role: &str, record: CertAndKey) {
        let previous = self.records.insert(role.to_owned(), record);
        debug_assert!(previous.is_none(), "identity {role} issued twice");
    }
}

/// Checks the declared order without issuing anything.
///
/// Walks the catalog exactly as [`materialize`] does, so a misordered catalog
/// fails before any key is generated.
pub fn validate(catalog: &[IdentityDescriptor]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for descriptor in catalog {
        if let Signer::Role(signer) = descriptor.signer {
            if !seen.contains(signer) {
                return Err(Error::UnknownSigner {
                    role: descriptor.role.to_owned(),
                    signer: signer.to_owned(),
                });
            }
            check_signer_is_root(descriptor, signer, catalog)?;
        }
        if !seen.insert(descriptor.role) {
            return Err(Error::DuplicateIdentity(descriptor.role.to_owned()));
        }
    }
    Ok(())
}

fn check_signer_is_root(
    descriptor: &IdentityDescriptor,
    signer: &str,
    catalog: &[IdentityDescriptor],
) -> Result<()> {
    let is_root = catalog
        .iter()
        .any(|d| d.role == signer && d.signer == Signer::SelfSigned);
    if is_root {
        Ok(())
    } else {
        Err(Error::SignerNotCa {
            role: descriptor.role.to_owned(),
            signer: signer.to_owned(),
        })
    }
}

/// Issues every identity in `catalog`, one after another, in declared order.
pub fn materialize(
    catalog: &[IdentityDescriptor],
    props: &ClusterProperties,
    ca: &CertificateAuthority,
) -> Result<Identities> {
    validate(catalog)?;

    let mut identities = Identities::default();
    for descriptor in catalog {
        let record = issue(descriptor, props, ca, &identities)?;
        identities.insert(descriptor.role, record);
    }
    info!(count = identities.len(), "materialized identity catalog");
    Ok(identities)
}

/// Like [`materialize`], but issues all roots concurrently and then all leaves concurrently.
///
/// Signers are only read while leaves are issued; finished records go into
/// the shared mapping under a lock.
pub fn materialize_parallel(
    catalog: &[IdentityDescriptor],
    props: &ClusterProperties,
    ca: &CertificateAuthority,
) -> Result<Identities> {
    validate(catalog)?;

    let (roots, leaves): (Vec<_>, Vec<_>) = catalog
        .iter()
        .partition(|d| d.signer == Signer::SelfSigned);

    let mut identities = issue_level(&roots, props, ca, &Identities::default())?;
    let issued_leaves = issue_level(&leaves, props, ca, &identities)?;
    identities.records.extend(issued_leaves.records);

    info!(count = identities.len(), "materialized identity catalog in parallel");
    Ok(identities)
}

fn issue_level(
    level: &[&IdentityDescriptor],
    props: &ClusterProperties,
    ca: &CertificateAuthority,
    signers: &Identities,
) -> Result<Identities> {
    let issued = Mutex::new(Identities::default());
    let shared = &issued;

    thread::scope(|s| {
        let handles: Vec<_> = level
            .iter()
            .map(|descriptor| {
                s.spawn(move || -> Result<()> {
                    let record = issue(descriptor, props, ca, signers)?;
                    shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(descriptor.role, record);
                    Ok(())
                })
            })
            .collect();

        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })
    })?;

    Ok(issued.into_inner().unwrap_or_else(PoisonError::into_inner))
}

fn issue(
    descriptor: &IdentityDescriptor,
    props: &ClusterProperties,
    ca: &CertificateAuthority,
    issued: &Identities,
) -> Result<CertAndKey> {
    let subject = descriptor.subject(props);
    match descriptor.signer {
        Signer::SelfSigned => {
            info!(role = descriptor.role, subject = %subject, "creating root CA");
            ca.create_root_ca(&subject)
        }
        Signer::Role(signer) => {
            let signer_record = issued.get(signer).ok_or_else(|| Error::UnknownSigner {
                role: descriptor.role.to_owned(),
                signer: signer.to_owned(),
            })?;
            let sans = descriptor.resolve_sans(props);
            debug!(role = descriptor.role, signer, ?sans, "creating leaf certificate");
            ca.create_leaf(&subject, &sans, descriptor.profile, signer_record)
        }
    }
}
