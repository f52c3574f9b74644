use std::collections::BTreeSet;
use std::io::Read;

use cluster_certgen::catalog::role;
use cluster_certgen::filesystem::Entry;
use cluster_certgen::{
    ClusterProperties, EmbeddedTemplates, Error, FileInfo, MemoryFilesystem, MemoryTemplates,
    Phase, Provisioner, TarGzFilesystem,
};
use flate2::read::GzDecoder;
use openssl::x509::X509;

const CA_KEY: &str = "etc/origin/master/ca.key";
const CA_CERT: &str = "etc/origin/master/ca.crt";
const MASTER_SERVER_CERT: &str = "etc/origin/master/master.server.crt";
const MASTER_SERVER_KEY: &str = "etc/origin/master/master.server.key";
const ADMIN_KUBECONFIG: &str = "etc/origin/master/admin.kubeconfig";
const BOOTSTRAP_KUBECONFIG: &str = "etc/origin/node/bootstrap.kubeconfig";

fn props() -> ClusterProperties {
    let mut props = ClusterProperties::new("cluster-master-0", "10.0.0.1".parse().unwrap());
    props.external_master_hostname = Some("cluster.example.com".to_string());
    props.cluster_username = "admin".to_string();
    props.cluster_password = "hunter2".to_string();
    props.pki.ca_key_size = 2048;
    props
}

fn provisioner() -> Provisioner {
    Provisioner::new(props(), EmbeddedTemplates)
}

fn file<'a>(fs: &'a MemoryFilesystem, path: &str) -> (&'a [u8], &'a FileInfo) {
    match fs.get(path) {
        Some(Entry::File { contents, info }) => (contents, info),
        other => panic!("{path}: expected a file, got {other:?}"),
    }
}

fn is_owner_only(info: &FileInfo) -> bool {
    info.mode & 0o077 == 0
}

#[test]
fn master_flow_writes_the_core_artifacts_with_the_right_permissions() {
    let mut fs = MemoryFilesystem::new();
    provisioner().master(&mut fs).unwrap();

    let (ca_pem, ca_info) = file(&fs, CA_CERT);
    assert_eq!(ca_info.mode, 0o644);
    let ca = X509::from_pem(ca_pem).unwrap();

    let (server_pem, server_info) = file(&fs, MASTER_SERVER_CERT);
    assert_eq!(server_info.mode, 0o644);
    let server = X509::from_pem(server_pem).unwrap();
    assert!(server.verify(&ca.public_key().unwrap()).unwrap());

    for path in [CA_KEY, MASTER_SERVER_KEY, ADMIN_KUBECONFIG, BOOTSTRAP_KUBECONFIG] {
        let (_, info) = file(&fs, path);
        assert!(is_owner_only(info), "{path} has mode {:o}", info.mode);
        assert_eq!((info.owner.as_str(), info.group.as_str()), ("root", "root"));
    }
}

#[test]
fn every_key_and_confidential_file_is_owner_only() {
    let mut fs = MemoryFilesystem::new();
    provisioner().master(&mut fs).unwrap();

    let sensitive = [
        "etc/origin/master/htpasswd",
        "etc/origin/master/session-secrets.yaml",
        "etc/origin/cloudprovider/azure.conf",
    ];
    for (path, entry) in fs.entries() {
        let private_key = path.ends_with(".key") && !path.ends_with(".public.key");
        let key_like = private_key || path.ends_with(".kubeconfig");
        if key_like || sensitive.contains(&path.as_str()) {
            assert!(is_owner_only(entry.info()), "{path} has mode {:o}", entry.info().mode);
        }
    }
    assert!(matches!(fs.get("tmp"), Some(Entry::Directory { info }) if info.mode == 0o1777));
}

#[test]
fn reruns_reproduce_the_same_paths() {
    let mut first = MemoryFilesystem::new();
    let mut second = MemoryFilesystem::new();
    provisioner().master(&mut first).unwrap();
    provisioner().master(&mut second).unwrap();

    assert_eq!(first.paths(), second.paths());
    assert_ne!(
        file(&first, CA_KEY).0,
        file(&second, CA_KEY).0,
        "keys are regenerated on each run"
    );
}

#[test]
fn node_flow_writes_only_bootstrap_material() {
    let provisioner = provisioner();
    let out = provisioner.prepare().unwrap();

    let mut fs = MemoryFilesystem::new();
    provisioner.node(&out, &mut fs).unwrap();

    let expected: BTreeSet<String> = [
        "etc/origin/node/ca.crt",
        "etc/origin/node/client-ca.crt",
        BOOTSTRAP_KUBECONFIG,
        "etc/origin/node/node-config.yaml",
        "etc/origin/cloudprovider/azure.conf",
        "etc/sysconfig/atomic-openshift-node",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(fs.paths(), expected);
    assert!(fs.get(CA_KEY).is_none());
    assert!(fs.get(MASTER_SERVER_KEY).is_none());
    assert!(fs.paths().iter().all(|p| !p.ends_with(".key")));
}

#[test]
fn node_and_master_share_one_ca() {
    let provisioner = provisioner();
    let out = provisioner.prepare().unwrap();

    let mut master = MemoryFilesystem::new();
    let mut node = MemoryFilesystem::new();
    provisioner.write_master(&out, &mut master).unwrap();
    provisioner.node(&out, &mut node).unwrap();

    assert_eq!(file(&master, CA_CERT).0, file(&node, "etc/origin/node/ca.crt").0);
    assert_eq!(
        file(&master, BOOTSTRAP_KUBECONFIG).0,
        file(&node, BOOTSTRAP_KUBECONFIG).0
    );
}

#[test]
fn bootstrap_bundle_authenticates_as_the_bootstrapper() {
    let mut fs = MemoryFilesystem::new();
    let out = provisioner().master(&mut fs).unwrap();

    let doc: serde_yaml::Value = serde_yaml::from_slice(file(&fs, BOOTSTRAP_KUBECONFIG).0).unwrap();
    assert_eq!(
        doc["clusters"][0]["cluster"]["server"],
        serde_yaml::Value::from("https://cluster-master-0:8443")
    );

    let bootstrapper = out.identities().require(role::NODE_BOOTSTRAPPER).unwrap();
    assert_eq!(
        out.bundle("bootstrap").unwrap().client().common_name(),
        bootstrapper.common_name()
    );
}

#[test]
fn first_failure_aborts_the_remaining_phases() {
    let mut fs = MemoryFilesystem::new().fail_on(ADMIN_KUBECONFIG);
    let err = provisioner().master(&mut fs).unwrap_err();

    assert_eq!(err.phase(), Some(Phase::WriteAccessBundles));
    assert!(matches!(err.root(), Error::Write { path, .. } if path == ADMIN_KUBECONFIG));

    // Certificates were written before the failure and are left in place.
    assert!(fs.get(CA_CERT).is_some());
    assert!(fs.get("etc/origin/master/master-config.yaml").is_none());
    assert!(fs.get("etc/origin/node/ca.crt").is_none());
}

#[test]
fn key_material_with_a_broad_mode_stops_the_run() {
    let templates = MemoryTemplates::new()
        .with("master/etc/origin/master/extra.key", "not really a key\n")
        .with("node/etc/origin/node/node-config.yaml", "master: {{ master.hostname }}\n");
    let mut fs = MemoryFilesystem::new();
    let err = Provisioner::new(props(), templates).master(&mut fs).unwrap_err();

    assert_eq!(err.phase(), Some(Phase::WriteStaticFiles));
    assert!(matches!(
        err.root(),
        Error::InsecurePermission { path, mode } if path == "etc/origin/master/extra.key" && *mode == 0o644
    ));
    assert!(fs.get("etc/origin/master/extra.key").is_none());
    assert!(fs.get("etc/origin/node/ca.crt").is_none());
    assert!(fs.get("etc/origin/node/node-config.yaml").is_none());
}

#[test]
fn master_flow_streams_into_a_tarball() {
    let mut fs = TarGzFilesystem::new(Vec::new());
    provisioner().master(&mut fs).unwrap();
    let bytes = fs.finish().unwrap();

    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    let mut modes = std::collections::BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
        let mode = entry.header().mode().unwrap();
        let mut sink = Vec::new();
        entry.read_to_end(&mut sink).unwrap();
        modes.insert(path, mode);
    }

    assert_eq!(modes[CA_KEY], 0o600);
    assert_eq!(modes[CA_CERT], 0o644);
    assert_eq!(modes[ADMIN_KUBECONFIG], 0o600);
    assert_eq!(modes["tmp"], 0o1777);
}

#[test]
fn parallel_issuance_produces_the_same_artifacts() {
    let mut sequential = MemoryFilesystem::new();
    let mut parallel = MemoryFilesystem::new();
    provisioner().master(&mut sequential).unwrap();
    provisioner().parallel(true).master(&mut parallel).unwrap();

    assert_eq!(sequential.paths(), parallel.paths());
}
