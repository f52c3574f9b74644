//! Master and node provisioning flows.
//!
//! A flow is a fixed sequence of [`Phase`]s. The first three only build
//! in-memory state (see [`Provisioner::prepare`]); the `Write*` phases hand
//! that state to the [`SecureWriter`]. The first failing phase aborts the
//! flow. Artifacts already written by earlier phases are left in place:
//! running the flow again is the way to recover.

use std::collections::BTreeMap;
use std::fmt;

use openssl::pkey::{PKey, Private};
use tracing::{debug, error, info};

use crate::catalog::{self, role, Identities, IdentityDescriptor, DEFAULT_CATALOG};
use crate::cert::{encode_private_key, encode_public_key, CertificateAuthority};
use crate::config::ClusterProperties;
use crate::error::{Error, Result};
use crate::filesystem::Filesystem;
use crate::kubeconfig::{AccessBundle, BundleSpec, BOOTSTRAP_BUNDLE, MASTER_BUNDLES};
use crate::template::{RenderedFile, Renderer, SessionSecrets, TemplateContext, TemplateSource};
use crate::writer::{Artifact, SecureWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    MaterializeCatalog,
    BuildAccessBundles,
    RenderStaticFiles,
    WriteCertificates,
    WriteAccessBundles,
    WriteStaticFiles,
    WriteBootstrapCertificates,
    WriteBootstrapAccessBundle,
    WriteNodeFiles,
}

impl Phase {
    /// Whether the phase produces artifacts rather than in-memory state.
    pub fn writes(self) -> bool {
        !matches!(
            self,
            Phase::MaterializeCatalog | Phase::BuildAccessBundles | Phase::RenderStaticFiles
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub const MASTER_FLOW: &[Phase] = &[
    Phase::MaterializeCatalog,
    Phase::BuildAccessBundles,
    Phase::RenderStaticFiles,
    Phase::WriteCertificates,
    Phase::WriteAccessBundles,
    Phase::WriteStaticFiles,
    Phase::WriteBootstrapCertificates,
    Phase::WriteNodeFiles,
];

/// Needs the output of a master [`Provisioner::prepare`].
pub const NODE_FLOW: &[Phase] = &[
    Phase::WriteBootstrapCertificates,
    Phase::WriteBootstrapAccessBundle,
    Phase::WriteNodeFiles,
];

const SERVICE_ACCOUNT_PRIVATE_KEY: &str = "etc/origin/master/serviceaccounts.private.key";
const SERVICE_ACCOUNT_PUBLIC_KEY: &str = "etc/origin/master/serviceaccounts.public.key";
const CA_BUNDLE: &str = "etc/origin/master/ca-bundle.crt";
const ETCD_CA_COPY: &str = "etc/etcd/ca.crt";
const NODE_CA: &str = "etc/origin/node/ca.crt";
const NODE_CLIENT_CA: &str = "etc/origin/node/client-ca.crt";

/// Runs one phase, logging it and attaching it to any error.
fn run_phase<T>(phase: Phase, step: impl FnOnce() -> Result<T>) -> Result<T> {
    info!(%phase, "starting phase");
    match step() {
        Ok(value) => {
            debug!(%phase, "phase complete");
            Ok(value)
        }
        Err(err) => {
            error!(%phase, error = %err, "phase failed");
            Err(err.in_phase(phase))
        }
    }
}

/// Runs the write phases of `flow` in order, stopping at the first failure.
fn run_writes(flow: &[Phase], mut step: impl FnMut(Phase) -> Result<()>) -> Result<()> {
    flow.iter()
        .copied()
        .filter(|phase| phase.writes())
        .try_for_each(|phase| run_phase(phase, || step(phase)))
}

/// Everything generated for one cluster before anything is written.
///
/// Built once by [`Provisioner::prepare`] and only read afterwards.
pub struct Materialized {
    identities: Identities,
    service_account_key: PKey<Private>,
    bundles: BTreeMap<String, AccessBundle>,
    master_files: Vec<RenderedFile>,
    node_files: Vec<RenderedFile>,
}

impl fmt::Debug for Materialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materialized")
            .field("identities", &self.identities.roles().collect::<Vec<_>>())
            .field("bundles", &self.bundles.keys().collect::<Vec<_>>())
            .field("master_files", &self.master_files.iter().map(RenderedFile::path).collect::<Vec<_>>())
            .field("node_files", &self.node_files.iter().map(RenderedFile::path).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Materialized {
    pub fn identities(&self) -> &Identities {
        &self.identities
    }

    pub fn service_account_key(&self) -> &PKey<Private> {
        &self.service_account_key
    }

    pub fn bundle(&self, name: &str) -> Option<&AccessBundle> {
        self.bundles.get(name)
    }

    pub fn bundles(&self) -> impl Iterator<Item = &AccessBundle> {
        self.bundles.values()
    }

    pub fn master_files(&self) -> &[RenderedFile] {
        &self.master_files
    }

    pub fn node_files(&self) -> &[RenderedFile] {
        &self.node_files
    }

    fn require_bundle(&self, spec: &BundleSpec) -> Result<&AccessBundle> {
        self.bundle(spec.name)
            .ok_or_else(|| Error::MissingIdentity(spec.client_role.to_owned()))
    }
}

/// Drives the provisioning flows for one cluster.
///
/// The [`CertificateAuthority`] lives as long as the provisioner, so every
/// certificate issued through it gets a distinct serial.
pub struct Provisioner {
    props: ClusterProperties,
    templates: Box<dyn TemplateSource>,
    catalog: &'static [IdentityDescriptor],
    ca: CertificateAuthority,
    parallel: bool,
}

impl Provisioner {
    pub fn new(props: ClusterProperties, templates: impl TemplateSource + 'static) -> Self {
        let ca = CertificateAuthority::new(props.key_settings());
        Provisioner {
            props,
            templates: Box::new(templates),
            catalog: DEFAULT_CATALOG,
            ca,
            parallel: false,
        }
    }

    pub fn with_catalog(mut self, catalog: &'static [IdentityDescriptor]) -> Self {
        self.catalog = catalog;
        self
    }

    /// Issue independent identities on multiple threads.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn properties(&self) -> &ClusterProperties {
        &self.props
    }

    /// Runs the in-memory phases of the master flow. Performs no I/O.
    pub fn prepare(&self) -> Result<Materialized> {
        let (identities, service_account_key) =
            run_phase(Phase::MaterializeCatalog, || self.materialize_catalog())?;
        let bundles = run_phase(Phase::BuildAccessBundles, || self.build_bundles(&identities))?;
        let (master_files, node_files) =
            run_phase(Phase::RenderStaticFiles, || self.render_static_files())?;

        Ok(Materialized {
            identities,
            service_account_key,
            bundles,
            master_files,
            node_files,
        })
    }

    /// Runs the whole master flow into `fs` and returns what was generated,
    /// so node flows can reuse it.
    pub fn master(&self, fs: &mut dyn Filesystem) -> Result<Materialized> {
        let out = self.prepare()?;
        self.write_master(&out, fs)?;
        Ok(out)
    }

    /// Runs the write phases of the master flow.
    pub fn write_master(&self, out: &Materialized, fs: &mut dyn Filesystem) -> Result<()> {
        let mut writer = SecureWriter::new(fs);
        run_writes(MASTER_FLOW, |phase| self.write_phase(phase, out, &mut writer))?;
        info!(artifacts = writer.written().count(), "master flow complete");
        Ok(())
    }

    pub fn node(&self, out: &Materialized, fs: &mut dyn Filesystem) -> Result<()> {
        let mut writer = SecureWriter::new(fs);
        run_writes(NODE_FLOW, |phase| self.write_phase(phase, out, &mut writer))?;
        info!(artifacts = writer.written().count(), "node flow complete");
        Ok(())
    }

    fn materialize_catalog(&self) -> Result<(Identities, PKey<Private>)> {
        let identities = if self.parallel {
            catalog::materialize_parallel(self.catalog, &self.props, &self.ca)?
        } else {
            catalog::materialize(self.catalog, &self.props, &self.ca)?
        };
        let service_account_key = self
            .ca
            .generate_key("serviceaccounts", self.ca.settings().key_size)?;
        Ok((identities, service_account_key))
    }

    fn build_bundles(&self, identities: &Identities) -> Result<BTreeMap<String, AccessBundle>> {
        MASTER_BUNDLES
            .iter()
            .chain(std::iter::once(&BOOTSTRAP_BUNDLE))
            .map(|spec| {
                let bundle = AccessBundle::from_spec(spec, &self.props, identities)?;
                debug!(bundle = spec.name, endpoint = bundle.endpoint(), "built access bundle");
                Ok((spec.name.to_owned(), bundle))
            })
            .collect()
    }

    fn render_static_files(&self) -> Result<(Vec<RenderedFile>, Vec<RenderedFile>)> {
        let secrets = SessionSecrets::generate()?;
        let ctx = TemplateContext::new(&self.props, &secrets);
        let renderer = Renderer::new(self.templates.as_ref());
        Ok((renderer.render_role("master", &ctx)?, renderer.render_role("node", &ctx)?))
    }

    fn write_phase(&self, phase: Phase, out: &Materialized, writer: &mut SecureWriter<'_>) -> Result<()> {
        match phase {
            Phase::MaterializeCatalog | Phase::BuildAccessBundles | Phase::RenderStaticFiles => Ok(()),
            Phase::WriteCertificates => self.write_certificates(out, writer),
            Phase::WriteAccessBundles => MASTER_BUNDLES
                .iter()
                .chain(std::iter::once(&BOOTSTRAP_BUNDLE))
                .try_for_each(|spec| write_bundle(spec, out, writer)),
            Phase::WriteStaticFiles => write_files(out.master_files(), writer),
            Phase::WriteBootstrapCertificates => {
                let ca = out.identities.require(role::CA)?.cert_pem()?;
                writer.write(&Artifact::certificate(NODE_CA, ca.clone()))?;
                writer.write(&Artifact::certificate(NODE_CLIENT_CA, ca))
            }
            Phase::WriteBootstrapAccessBundle => write_bundle(&BOOTSTRAP_BUNDLE, out, writer),
            Phase::WriteNodeFiles => write_files(out.node_files(), writer),
        }
    }

    fn write_certificates(&self, out: &Materialized, writer: &mut SecureWriter<'_>) -> Result<()> {
        for descriptor in self.catalog {
            let Some(stem) = descriptor.path else {
                continue;
            };
            let record = out.identities.require(descriptor.role)?;
            writer.write(&Artifact::certificate(format!("{stem}.crt"), record.cert_pem()?))?;
            writer.write(&Artifact::private_key(format!("{stem}.key"), record.key_pem()?))?;
        }

        let ca = out.identities.require(role::CA)?.cert_pem()?;
        writer.write(&Artifact::certificate(CA_BUNDLE, ca))?;
        if let Some(etcd_ca) = out.identities.get(role::ETCD_CA) {
            writer.write(&Artifact::certificate(ETCD_CA_COPY, etcd_ca.cert_pem()?))?;
        }

        writer.write(&Artifact::private_key(
            SERVICE_ACCOUNT_PRIVATE_KEY,
            encode_private_key(&out.service_account_key)?,
        ))?;
        writer.write(&Artifact::certificate(
            SERVICE_ACCOUNT_PUBLIC_KEY,
            encode_public_key(&out.service_account_key)?,
        ))
    }
}

fn write_bundle(spec: &BundleSpec, out: &Materialized, writer: &mut SecureWriter<'_>) -> Result<()> {
    let bundle = out.require_bundle(spec)?;
    writer.write(&Artifact::kubeconfig(spec.path, bundle.to_kubeconfig()?))
}

fn write_files(files: &[RenderedFile], writer: &mut SecureWriter<'_>) -> Result<()> {
    files.iter().try_for_each(|file| match file {
        RenderedFile::File(artifact) => writer.write(artifact),
        RenderedFile::Directory(dir) => writer.mkdir(dir),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::MemoryFilesystem;
    use crate::template::MemoryTemplates;

    fn provisioner() -> Provisioner {
        let mut props = ClusterProperties::new("cluster-master-0", "10.0.0.1".parse().unwrap());
        props.pki.ca_key_size = 2048;
        let templates = MemoryTemplates::new()
            .with("master/etc/origin/master/master-config.yaml", "host: {{ master.hostname }}\n")
            .with("master/tmp/.keep", "")
            .with("node/etc/origin/node/node-config.yaml", "master: {{ master.hostname }}\n");
        Provisioner::new(props, templates)
    }

    #[test]
    fn only_prepare_phases_are_in_memory() {
        let prepare: Vec<Phase> = MASTER_FLOW.iter().copied().filter(|p| !p.writes()).collect();
        assert_eq!(
            prepare,
            vec![
                Phase::MaterializeCatalog,
                Phase::BuildAccessBundles,
                Phase::RenderStaticFiles
            ]
        );
        assert!(NODE_FLOW.iter().all(|p| p.writes()));
    }

    #[test]
    fn prepare_builds_every_bundle_and_file() {
        let out = provisioner().prepare().unwrap();

        assert_eq!(out.identities().len(), DEFAULT_CATALOG.len());
        for spec in MASTER_BUNDLES.iter().chain(std::iter::once(&BOOTSTRAP_BUNDLE)) {
            assert!(out.bundle(spec.name).is_some(), "{}", spec.name);
        }
        assert_eq!(out.master_files().len(), 2);
        assert_eq!(out.node_files().len(), 1);
    }

    #[test]
    fn debug_output_lists_names_without_key_material() {
        let out = provisioner().prepare().unwrap();
        let debug = format!("{out:?}");

        assert!(debug.contains("master.server"));
        assert!(debug.contains("bootstrap"));
        assert!(debug.contains("etc/origin/master/master-config.yaml"));
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(!debug.contains("client-key-data"));
    }

    #[test]
    fn phases_run_in_order_and_stop_at_the_first_failure() {
        let mut seen = Vec::new();
        let err = run_writes(MASTER_FLOW, |phase| {
            seen.push(phase);
            if phase == Phase::WriteAccessBundles {
                Err(Error::MissingIdentity("admin".to_string()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        assert_eq!(seen, vec![Phase::WriteCertificates, Phase::WriteAccessBundles]);
        assert_eq!(err.phase(), Some(Phase::WriteAccessBundles));
        assert!(matches!(err.root(), Error::MissingIdentity(_)));
    }

    #[test]
    fn template_failures_are_reported_from_render_phase() {
        let props = provisioner().properties().clone();
        let templates = MemoryTemplates::new().with("master/broken", "{{ nope }}");
        let err = Provisioner::new(props, templates).prepare().unwrap_err();

        assert_eq!(err.phase(), Some(Phase::RenderStaticFiles));
        assert!(matches!(err.root(), Error::Render { .. }));
    }

    #[test]
    fn master_flow_writes_bootstrap_material() {
        let mut fs = MemoryFilesystem::new();
        provisioner().master(&mut fs).unwrap();

        for path in [
            "etc/origin/master/ca.crt",
            "etc/origin/master/ca.key",
            CA_BUNDLE,
            ETCD_CA_COPY,
            SERVICE_ACCOUNT_PRIVATE_KEY,
            SERVICE_ACCOUNT_PUBLIC_KEY,
            NODE_CA,
            NODE_CLIENT_CA,
            BOOTSTRAP_BUNDLE.path,
            "tmp",
        ] {
            assert!(fs.get(path).is_some(), "{path} missing");
        }
        assert_eq!(fs.get(SERVICE_ACCOUNT_PRIVATE_KEY).unwrap().info().mode, 0o600);
        assert_eq!(fs.get(SERVICE_ACCOUNT_PUBLIC_KEY).unwrap().info().mode, 0o644);
    }
}
