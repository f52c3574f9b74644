//! Static configuration files rendered from templates.
//!
//! Template names are `<role>/<path>`, e.g. `master/etc/origin/master/master-config.yaml`.
//! A name ending in `/.keep` stands for an empty directory.

use std::borrow::Cow;
use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use include_dir::{include_dir, Dir};
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use openssl::rand::rand_bytes;
use openssl::sha::sha1;
use serde::Serialize;
use tracing::debug;

use crate::config::{AzureConfig, ClusterProperties};
use crate::error::{Error, Result};
use crate::filesystem::FileInfo;
use crate::writer::{Artifact, ArtifactClass, DirectoryArtifact};

static TEMPLATES: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/templates");

/// Read access to template content by name.
pub trait TemplateSource {
    fn names(&self) -> Vec<String>;

    fn load(&self, name: &str) -> Option<Cow<'_, [u8]>>;
}

/// Templates compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedTemplates;

fn collect_names(dir: &Dir<'_>, names: &mut Vec<String>) {
    for file in dir.files() {
        if let Some(name) = file.path().to_str() {
            names.push(name.to_owned());
        }
    }
    for child in dir.dirs() {
        collect_names(child, names);
    }
}

impl TemplateSource for EmbeddedTemplates {
    fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_names(&TEMPLATES, &mut names);
        names.sort();
        names
    }

    fn load(&self, name: &str) -> Option<Cow<'_, [u8]>> {
        TEMPLATES.get_file(name).map(|f| Cow::Borrowed(f.contents()))
    }
}

/// Templates held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTemplates {
    templates: BTreeMap<String, Vec<u8>>,
}

impl MemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.templates.insert(name.into(), contents.into());
        self
    }
}

impl TemplateSource for MemoryTemplates {
    fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    fn load(&self, name: &str) -> Option<Cow<'_, [u8]>> {
        self.templates.get(name).map(|c| Cow::Borrowed(c.as_slice()))
    }
}

/// Random secrets the master uses to sign and encrypt session cookies.
#[derive(Clone, Serialize)]
pub struct SessionSecrets {
    pub auth: String,
    pub encryption: String,
}

impl SessionSecrets {
    pub fn generate() -> Result<Self> {
        Ok(SessionSecrets {
            auth: random_secret()?,
            encryption: random_secret()?,
        })
    }
}

fn random_secret() -> Result<String> {
    let mut buf = [0u8; 24];
    rand_bytes(&mut buf).map_err(|source| Error::KeyGeneration {
        role: "session-secrets".to_string(),
        source,
    })?;
    Ok(STANDARD.encode(buf))
}

#[derive(Serialize)]
struct MasterContext<'a> {
    hostname: &'a str,
    external_hostname: &'a str,
    ip: String,
    ips: Vec<String>,
    port: u16,
}

/// Values templates can refer to.
#[derive(Serialize)]
pub struct TemplateContext<'a> {
    master: MasterContext<'a>,
    cluster_username: &'a str,
    cluster_password: &'a str,
    session: &'a SessionSecrets,
    azure: &'a AzureConfig,
}

impl<'a> TemplateContext<'a> {
    pub fn new(props: &'a ClusterProperties, session: &'a SessionSecrets) -> Self {
        let ips: Vec<String> = props.master_ips.iter().map(|ip| ip.to_string()).collect();
        TemplateContext {
            master: MasterContext {
                hostname: &props.master_hostname,
                external_hostname: props.external_hostname(),
                ip: ips.first().cloned().unwrap_or_default(),
                ips,
                port: props.port,
            },
            cluster_username: &props.cluster_username,
            cluster_password: &props.cluster_password,
            session,
            azure: &props.azure,
        }
    }
}

/// Apache `{SHA}` htpasswd entry.
fn htpasswd(user: String, password: String) -> String {
    format!("{}:{{SHA}}{}", user, STANDARD.encode(sha1(password.as_bytes())))
}

/// Ownership, mode and class of a rendered path.
pub fn file_info(path: &str) -> (FileInfo, ArtifactClass) {
    match path {
        "etc/origin/master/htpasswd"
        | "etc/origin/master/session-secrets.yaml"
        | "etc/origin/cloudprovider/azure.conf" => (FileInfo::root(0o600), ArtifactClass::Confidential),
        _ => (FileInfo::root(0o644), ArtifactClass::Public),
    }
}

/// Ownership and mode of a directory created from a `.keep` template.
pub fn directory_info(path: &str) -> FileInfo {
    match path {
        "tmp" => FileInfo::root(0o1777),
        _ => FileInfo::root(0o755),
    }
}

/// Output of rendering one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedFile {
    File(Artifact),
    Directory(DirectoryArtifact),
}

impl RenderedFile {
    pub fn path(&self) -> &str {
        match self {
            RenderedFile::File(artifact) => &artifact.path,
            RenderedFile::Directory(dir) => &dir.path,
        }
    }
}

pub struct Renderer<'s> {
    source: &'s dyn TemplateSource,
    env: Environment<'static>,
}

impl<'s> Renderer<'s> {
    pub fn new(source: &'s dyn TemplateSource) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_function("htpasswd", htpasswd);
        Renderer { source, env }
    }

    pub fn render(&self, name: &str, ctx: &TemplateContext<'_>) -> Result<Vec<u8>> {
        let raw = self
            .source
            .load(name)
            .ok_or_else(|| Error::TemplateNotFound(name.to_owned()))?;
        let text = std::str::from_utf8(&raw).map_err(|e| Error::Render {
            name: name.to_owned(),
            source: minijinja::Error::new(ErrorKind::InvalidOperation, "template is not UTF-8")
                .with_source(e),
        })?;

        self.env
            .render_named_str(name, text, ctx)
            .map(String::into_bytes)
            .map_err(|source| Error::Render {
                name: name.to_owned(),
                source,
            })
    }

    /// Renders every template under `<role>/`, in name order.
    pub fn render_role(&self, role: &str, ctx: &TemplateContext<'_>) -> Result<Vec<RenderedFile>> {
        let prefix = format!("{}/", role);
        let mut names: Vec<String> = self
            .source
            .names()
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        names.sort();

        let mut rendered = Vec::with_capacity(names.len());
        for name in &names {
            let path = &name[prefix.len()..];
            if let Some(dir) = path.strip_suffix("/.keep") {
                rendered.push(RenderedFile::Directory(DirectoryArtifact {
                    path: dir.to_owned(),
                    info: directory_info(dir),
                }));
                continue;
            }

            let contents = self.render(name, ctx)?;
            let (info, class) = file_info(path);
            debug!(template = %name, bytes = contents.len(), "rendered template");
            rendered.push(RenderedFile::File(Artifact::new(path, contents, info, class)));
        }
        Ok(rendered)
    }
}
