//! TLS material for etcd and Vault
//!
//! A fresh self-signed CA is generated for each issuance run. Its private key
//! is dropped when the run ends; only the CA certificate is written out,
//! next to every leaf it signed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use tracing::{debug, info};

use super::api::{update_with_retry, ResourceApi};
use super::constants::*;
use super::resources::owner_reference;
use crate::crd::VaultService;
use crate::error::Result;

const CA_COMMON_NAME: &str = "vault operator CA";
const ORGANIZATION: &str = "coreos.com";

/// What a leaf certificate is allowed to authenticate as
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertUsage {
    Client,
    Server,
    /// Server and client, for members talking to each other
    Peer,
}

/// PEM-encoded leaf key and certificate
#[derive(Clone, Debug)]
pub struct IssuedCert {
    pub key_pem: String,
    pub cert_pem: String,
}

/// In-memory signing authority
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = distinguished_name(CA_COMMON_NAME);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn issue(&self, common_name: &str, sans: &[String], usage: CertUsage) -> Result<IssuedCert> {
        let mut params = CertificateParams::new(sans.to_vec())?;
        params.distinguished_name = distinguished_name(common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match usage {
            CertUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            CertUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            CertUsage::Peer => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        };

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(IssuedCert {
            key_pem: key.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

// ============================================================================
// SANs
// ============================================================================

pub fn storage_server_sans(name: &str, namespace: &str, domain: &str) -> Vec<String> {
    let etcd = etcd_cluster_name(name);
    vec![
        "localhost".to_string(),
        format!("*.{etcd}.{namespace}.svc"),
        format!("{etcd}-client"),
        format!("{etcd}-client.{namespace}"),
        format!("{etcd}-client.{namespace}.svc"),
        format!("*.{etcd}.{namespace}.svc.{domain}"),
        format!("{etcd}-client.{namespace}.svc.{domain}"),
    ]
}

pub fn storage_peer_sans(name: &str, namespace: &str, domain: &str) -> Vec<String> {
    let etcd = etcd_cluster_name(name);
    vec![
        format!("*.{etcd}.{namespace}.svc"),
        format!("*.{etcd}.{namespace}.svc.{domain}"),
    ]
}

pub fn vault_server_sans(name: &str, namespace: &str) -> Vec<String> {
    vec![
        "localhost".to_string(),
        format!("*.{namespace}.pod"),
        format!("{name}.{namespace}.svc"),
    ]
}

// ============================================================================
// Secrets
// ============================================================================

pub fn build_tls_secret(vs: &VaultService, name: &str, data: BTreeMap<&str, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace_of(vs)),
            labels: Some(selector_labels(&vs.name_any())),
            owner_references: Some(vec![owner_reference(vs)]),
            ..Default::default()
        },
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn leaf_data(
    ca: &CertificateAuthority,
    leaf: IssuedCert,
    keys: (&'static str, &'static str, &'static str),
) -> BTreeMap<&'static str, String> {
    let (key_name, cert_name, ca_name) = keys;
    BTreeMap::from([
        (key_name, leaf.key_pem),
        (cert_name, leaf.cert_pem),
        (ca_name, ca.cert_pem()),
    ])
}

/// Create each secret, overwriting the data of any that already exist.
///
/// Returns how many secrets were written.
async fn write_secrets<A: ResourceApi>(api: &A, namespace: &str, secrets: &[Secret]) -> Result<usize> {
    let mut written = 0;
    for secret in secrets {
        let name = secret.name_any();
        if api.create(namespace, secret).await? {
            info!("Created TLS secret {}/{}", namespace, name);
            written += 1;
            continue;
        }
        let replaced = update_with_retry(api, namespace, &name, |existing: &mut Secret| {
            if existing.data == secret.data {
                return false;
            }
            existing.data = secret.data.clone();
            true
        })
        .await?;
        if replaced {
            info!("Replaced TLS secret {}/{}", namespace, name);
            written += 1;
        }
    }
    Ok(written)
}

/// Names of the secrets that are missing from `namespace`
async fn missing_secrets<A: ResourceApi>(api: &A, namespace: &str, names: &[String]) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for name in names {
        if api.get::<Secret>(namespace, name).await?.is_none() {
            missing.push(name.clone());
        }
    }
    Ok(missing)
}

/// Client, server and peer bundles for etcd, signed by one throwaway CA
pub fn issue_storage_bundles(vs: &VaultService, cluster_domain: &str) -> Result<Vec<Secret>> {
    let namespace = namespace_of(vs);
    let name = vs.name_any();
    let ca = CertificateAuthority::generate()?;
    let mut secrets = Vec::with_capacity(3);

    let client = ca.issue("etcd client", &[], CertUsage::Client)?;
    secrets.push(build_tls_secret(
        vs,
        &storage_client_secret(&name),
        leaf_data(&ca, client, (STORAGE_CLIENT_KEY, STORAGE_CLIENT_CERT, STORAGE_CLIENT_CA)),
    ));

    let server = ca.issue(
        "etcd server",
        &storage_server_sans(&name, &namespace, cluster_domain),
        CertUsage::Peer,
    )?;
    secrets.push(build_tls_secret(
        vs,
        &storage_server_secret(&name),
        leaf_data(&ca, server, (SERVER_KEY, SERVER_CERT, SERVER_CA)),
    ));

    if vs.spec.static_tls().and_then(|s| s.peer_secret.as_ref()).is_none() {
        let peer = ca.issue(
            "etcd peer",
            &storage_peer_sans(&name, &namespace, cluster_domain),
            CertUsage::Peer,
        )?;
        secrets.push(build_tls_secret(
            vs,
            &storage_peer_secret(vs),
            leaf_data(&ca, peer, (PEER_KEY, PEER_CERT, PEER_CA)),
        ));
    }
    Ok(secrets)
}

/// Vault server bundle plus the client trust bundle holding only the CA
pub fn issue_vault_bundles(vs: &VaultService) -> Result<Vec<Secret>> {
    let ca = CertificateAuthority::generate()?;
    let server = ca.issue(
        "vault server",
        &vault_server_sans(&vs.name_any(), &namespace_of(vs)),
        CertUsage::Peer,
    )?;
    Ok(vec![
        build_tls_secret(
            vs,
            &vault_server_secret(vs),
            leaf_data(&ca, server, (SERVER_KEY, SERVER_CERT, SERVER_CA)),
        ),
        build_tls_secret(
            vs,
            &vault_client_secret(vs),
            BTreeMap::from([(CLIENT_TRUST_CA, ca.cert_pem())]),
        ),
    ])
}

/// Secrets [`issue_storage_bundles`] produces for this VaultService
pub fn storage_secret_names(vs: &VaultService) -> Vec<String> {
    let name = vs.name_any();
    let mut names = vec![storage_client_secret(&name), storage_server_secret(&name)];
    if vs.spec.static_tls().and_then(|s| s.peer_secret.as_ref()).is_none() {
        names.push(storage_peer_secret(vs));
    }
    names
}

/// Issue the etcd bundles unless every one of them exists.
///
/// A partially written set is issued again as a whole so all three bundles
/// chain to the same CA. Returns how many secrets were written.
pub async fn ensure_storage_tls<A: ResourceApi>(
    api: &A,
    vs: &VaultService,
    cluster_domain: &str,
) -> Result<usize> {
    let namespace = namespace_of(vs);
    let missing = missing_secrets(api, &namespace, &storage_secret_names(vs)).await?;
    if missing.is_empty() {
        debug!("etcd TLS secrets in {} exist, skipping", namespace);
        return Ok(0);
    }

    info!(?missing, "Issuing etcd TLS bundles for {}/{}", namespace, vs.name_any());
    let secrets = issue_storage_bundles(vs, cluster_domain)?;
    write_secrets(api, &namespace, &secrets).await
}

/// Issue the Vault bundles.
///
/// Skipped when static secrets are named, or when both the server and the
/// client trust secret exist. Otherwise both are written from one fresh CA.
pub async fn ensure_vault_tls<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<usize> {
    if !vs.spec.is_auto_tls() {
        return Ok(0);
    }

    let namespace = namespace_of(vs);
    let names = [vault_server_secret(vs), vault_client_secret(vs)];
    let missing = missing_secrets(api, &namespace, &names).await?;
    if missing.is_empty() {
        debug!("Vault TLS secrets in {} exist, skipping", namespace);
        return Ok(0);
    }

    info!(?missing, "Issuing Vault TLS bundles for {}/{}", namespace, vs.name_any());
    let secrets = issue_vault_bundles(vs)?;
    write_secrets(api, &namespace, &secrets).await
}

/// CA certificate Vault clients must trust, read from the client trust secret
pub async fn client_trust_ca<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<String> {
    let namespace = namespace_of(vs);
    let name = vault_client_secret(vs);
    let secret = api
        .get::<Secret>(&namespace, &name)
        .await?
        .ok_or_else(|| crate::Error::NotFound(format!("Secret {namespace}/{name}")))?;

    secret
        .data
        .as_ref()
        .and_then(|d| d.get(CLIENT_TRUST_CA))
        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
        .ok_or_else(|| crate::Error::MissingField(format!("{name}.data.{CLIENT_TRUST_CA}")))
}
