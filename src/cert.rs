use std::fmt;
use std::net::IpAddr;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Builder, X509Name, X509StoreContext, X509};
use tracing::debug;

use crate::error::{Error, Result};
use crate::serial::SerialAllocator;

/// Distinguished name of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organizations: Vec<String>,
}

impl Subject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Subject {
            common_name: common_name.into(),
            organizations: Vec::new(),
        }
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organizations.push(organization.into());
        self
    }

    fn to_x509_name(&self) -> std::result::Result<X509Name, ErrorStack> {
        let mut name = X509Name::builder()?;
        for organization in &self.organizations {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
        }
        name.append_entry_by_nid(Nid::COMMONNAME, &self.common_name)?;
        Ok(name.build())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for organization in &self.organizations {
            write!(f, "O={},", organization)?;
        }
        write!(f, "CN={}", self.common_name)
    }
}

/// A subject alternative name, already sorted into the extension field it belongs in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum San {
    Dns(String),
    Ip(IpAddr),
}

impl San {
    /// Anything that parses as an IPv4 or IPv6 literal becomes an IP entry, everything else a DNS name.
    pub fn classify(value: &str) -> San {
        match value.parse::<IpAddr>() {
            Ok(ip) => San::Ip(ip),
            Err(_) => San::Dns(value.to_owned()),
        }
    }
}

impl From<IpAddr> for San {
    fn from(ip: IpAddr) -> Self {
        San::Ip(ip)
    }
}

/// Key usage flavour of an issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Ca,
    Server,
    Client,
    /// Server and client auth, as etcd peers need.
    Peer,
}

impl Profile {
    fn basic_constraints(self) -> std::result::Result<openssl::x509::X509Extension, ErrorStack> {
        let mut bc = BasicConstraints::new();
        bc.critical();
        if self == Profile::Ca {
            bc.ca();
        }
        bc.build()
    }

    fn key_usage(self) -> std::result::Result<openssl::x509::X509Extension, ErrorStack> {
        let mut ku = KeyUsage::new();
        ku.critical().digital_signature().key_encipherment();
        if self == Profile::Ca {
            ku.key_cert_sign().crl_sign();
        }
        ku.build()
    }

    fn extended_key_usage(
        self,
    ) -> std::result::Result<Option<openssl::x509::X509Extension>, ErrorStack> {
        let mut eku = ExtendedKeyUsage::new();
        match self {
            Profile::Ca => return Ok(None),
            Profile::Server => eku.server_auth(),
            Profile::Client => eku.client_auth(),
            Profile::Peer => eku.server_auth().client_auth(),
        };
        eku.build().map(Some)
    }
}

/// A certificate together with the private key it was issued for.
#[derive(Clone)]
pub struct CertAndKey {
    cert: X509,
    key: PKey<Private>,
}

impl fmt::Debug for CertAndKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertAndKey")
            .field("subject", &self.common_name())
            .field("serial", &self.serial())
            .finish_non_exhaustive()
    }
}

impl CertAndKey {
    pub fn cert(&self) -> &X509 {
        &self.cert
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    pub fn common_name(&self) -> Option<String> {
        self.cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| String::from_utf8(entry.data().as_slice().to_vec()).ok())
    }

    pub fn serial(&self) -> Option<u64> {
        let serial = self.cert.serial_number().to_bn().ok()?;
        serial.to_dec_str().ok()?.parse().ok()
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        self.cert.to_pem().map_err(|source| Error::Encoding {
            what: "certificate".to_string(),
            source,
        })
    }

    /// PKCS#1 PEM of the private key. Only the artifact writer should persist this.
    pub fn key_pem(&self) -> Result<Vec<u8>> {
        encode_private_key(&self.key)
    }

    /// Runs standard chain validation of this certificate against `issuer` as the only trust anchor.
    pub fn verify_issued_by(&self, issuer: &CertAndKey) -> Result<bool> {
        verify_chain(&self.cert, &issuer.cert).map_err(|source| Error::Encoding {
            what: "certificate chain".to_string(),
            source,
        })
    }
}

fn verify_chain(leaf: &X509, anchor: &X509) -> std::result::Result<bool, ErrorStack> {
    let mut store = X509StoreBuilder::new()?;
    store.add_cert(anchor.clone())?;
    let store = store.build();

    let chain: Stack<X509> = Stack::new()?;
    let mut ctx = X509StoreContext::new()?;
    ctx.init(&store, leaf, &chain, |c| c.verify_cert())
}

pub(crate) fn encode_private_key(key: &PKey<Private>) -> Result<Vec<u8>> {
    key.rsa()
        .and_then(|rsa| rsa.private_key_to_pem())
        .map_err(|source| Error::Encoding {
            what: "private key".to_string(),
            source,
        })
}

pub(crate) fn encode_public_key(key: &PKey<Private>) -> Result<Vec<u8>> {
    key.public_key_to_pem().map_err(|source| Error::Encoding {
        what: "public key".to_string(),
        source,
    })
}

/// Key sizes and lifetimes used when issuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySettings {
    pub ca_key_size: u32,
    pub key_size: u32,
    pub ca_validity_days: u32,
    pub validity_days: u32,
}

impl Default for KeySettings {
    fn default() -> Self {
        KeySettings {
            ca_key_size: 4096,
            key_size: 2048,
            ca_validity_days: 1825,
            validity_days: 730,
        }
    }
}

/// Issuing context for one provisioning run. Owns the serial counter.
///
/// All issuing methods take `&self`, so one context can be shared between
/// threads issuing independent identities.
#[derive(Debug, Default)]
pub struct CertificateAuthority {
    serials: SerialAllocator,
    settings: KeySettings,
}

impl CertificateAuthority {
    pub fn new(settings: KeySettings) -> Self {
        CertificateAuthority {
            serials: SerialAllocator::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &KeySettings {
        &self.settings
    }

    /// Generates a bare RSA key pair, e.g. for service account token signing.
    pub fn generate_key(&self, role: &str, bits: u32) -> Result<PKey<Private>> {
        Rsa::generate(bits)
            .and_then(PKey::from_rsa)
            .map_err(|source| Error::KeyGeneration {
                role: role.to_owned(),
                source,
            })
    }

    pub fn create_root_ca(&self, subject: &Subject) -> Result<CertAndKey> {
        let key = self.generate_key(&subject.common_name, self.settings.ca_key_size)?;
        let cert = self
            .build(subject, &[], Profile::Ca, &key, None)
            .map_err(|source| Error::Signing {
                subject: subject.to_string(),
                source,
            })?;

        debug!(subject = %subject, "issued self-signed CA");
        Ok(CertAndKey { cert, key })
    }

    pub fn create_leaf(
        &self,
        subject: &Subject,
        sans: &[San],
        profile: Profile,
        signer: &CertAndKey,
    ) -> Result<CertAndKey> {
        let key = self.generate_key(&subject.common_name, self.settings.key_size)?;
        let cert = self
            .build(subject, sans, profile, &key, Some(signer))
            .map_err(|source| Error::Signing {
                subject: subject.to_string(),
                source,
            })?;

        debug!(subject = %subject, sans = sans.len(), "issued leaf certificate");
        Ok(CertAndKey { cert, key })
    }

    fn build(
        &self,
        subject: &Subject,
        sans: &[San],
        profile: Profile,
        key: &PKey<Private>,
        signer: Option<&CertAndKey>,
    ) -> std::result::Result<X509, ErrorStack> {
        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let serial = BigNum::from_slice(&self.serials.next().to_be_bytes())?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let name = subject.to_x509_name()?;
        builder.set_subject_name(&name)?;
        match signer {
            Some(signer) => builder.set_issuer_name(signer.cert.subject_name())?,
            None => builder.set_issuer_name(&name)?,
        }
        builder.set_pubkey(key)?;

        let validity = match profile {
            Profile::Ca => self.settings.ca_validity_days,
            _ => self.settings.validity_days,
        };
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(validity)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.append_extension(profile.basic_constraints()?)?;
        builder.append_extension(profile.key_usage()?)?;
        if let Some(eku) = profile.extended_key_usage()? {
            builder.append_extension(eku)?;
        }
        append_key_identifiers(&mut builder, signer)?;

        if !sans.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for name in sans {
                match name {
                    San::Dns(dns) => san.dns(dns),
                    San::Ip(ip) => san.ip(&ip.to_string()),
                };
            }
            let san = san.build(&builder.x509v3_context(signer.map(|s| &*s.cert), None))?;
            builder.append_extension(san)?;
        }

        let signing_key = signer.map(|s| &s.key).unwrap_or(key);
        builder.sign(signing_key, MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

fn append_key_identifiers(
    builder: &mut X509Builder,
    signer: Option<&CertAndKey>,
) -> std::result::Result<(), ErrorStack> {
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    if let Some(signer) = signer {
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(Some(&*signer.cert), None))?;
        builder.append_extension(aki)?;
    }
    Ok(())
}
