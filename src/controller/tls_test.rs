//! Certificate contents and secret layout of the generated TLS material

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use super::constants::*;
use super::fake::FakeApi;
use super::tls::*;
use crate::crd::{StaticTls, TlsPolicy, VaultService, VaultServiceSpec};

const NS: &str = "vault";

/// The parts of a certificate the operator controls
#[derive(Debug)]
struct CertSummary {
    subject_cn: String,
    issuer_cn: String,
    sans: Vec<String>,
    is_ca: bool,
    server_auth: bool,
    client_auth: bool,
}

fn summarize(pem: &[u8]) -> CertSummary {
    let (_, pem) = parse_x509_pem(pem).unwrap();
    let cert = pem.parse_x509().unwrap();
    let cn = |name: &x509_parser::x509::X509Name| {
        name.iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let sans: Vec<String> = cert
        .subject_alternative_name()
        .unwrap()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|n| match n {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let (server_auth, client_auth) = cert
        .extended_key_usage()
        .unwrap()
        .map(|ext| (ext.value.server_auth, ext.value.client_auth))
        .unwrap_or_default();

    CertSummary {
        subject_cn: cn(cert.subject()),
        issuer_cn: cn(cert.issuer()),
        sans,
        is_ca: cert.is_ca(),
        server_auth,
        client_auth,
    }
}

fn mock_vault() -> VaultService {
    let mut vs = VaultService::new("example", VaultServiceSpec::default());
    vs.metadata.namespace = Some(NS.to_string());
    vs.metadata.uid = Some("uid-1".to_string());
    vs.set_defaults();
    vs
}

fn with_static_tls(mut vs: VaultService, peer_secret: Option<&str>) -> VaultService {
    vs.spec.tls = Some(TlsPolicy {
        static_tls: Some(StaticTls {
            server_secret: "my-server".to_string(),
            client_secret: "my-client".to_string(),
            peer_secret: peer_secret.map(String::from),
            operator_secret: None,
        }),
    });
    vs
}

fn find<'a>(secrets: &'a [Secret], name: &str) -> &'a Secret {
    secrets.iter().find(|s| s.name_any() == name).unwrap()
}

fn entry<'a>(secret: &'a Secret, key: &str) -> &'a [u8] {
    &secret.data.as_ref().unwrap()[key].0
}

fn keys(secret: &Secret) -> Vec<&str> {
    secret.data.as_ref().unwrap().keys().map(String::as_str).collect()
}

#[test]
fn test_storage_bundles_share_one_ca() {
    let vs = mock_vault();
    let secrets = issue_storage_bundles(&vs, "cluster.local").unwrap();
    assert_eq!(secrets.len(), 3);

    let client = find(&secrets, "example-etcd-client-tls");
    let server = find(&secrets, "example-etcd-server-tls");
    let peer = find(&secrets, "example-etcd-peer-tls");

    assert_eq!(keys(client), vec![STORAGE_CLIENT_CA, STORAGE_CLIENT_CERT, STORAGE_CLIENT_KEY]);
    assert_eq!(keys(server), vec![SERVER_CA, SERVER_CERT, SERVER_KEY]);
    assert_eq!(keys(peer), vec![PEER_CA, PEER_CERT, PEER_KEY]);

    let ca = entry(client, STORAGE_CLIENT_CA);
    assert_eq!(entry(server, SERVER_CA), ca);
    assert_eq!(entry(peer, PEER_CA), ca);

    let ca = summarize(ca);
    assert!(ca.is_ca);
    assert_eq!(ca.subject_cn, "vault operator CA");
}

#[test]
fn test_storage_certificates() {
    let vs = mock_vault();
    let secrets = issue_storage_bundles(&vs, "cluster.local").unwrap();

    let client = summarize(entry(find(&secrets, "example-etcd-client-tls"), STORAGE_CLIENT_CERT));
    assert_eq!(client.subject_cn, "etcd client");
    assert_eq!(client.issuer_cn, "vault operator CA");
    assert!(client.sans.is_empty());
    assert!(client.client_auth && !client.server_auth);
    assert!(!client.is_ca);

    let server = summarize(entry(find(&secrets, "example-etcd-server-tls"), SERVER_CERT));
    assert_eq!(server.subject_cn, "etcd server");
    assert_eq!(server.sans, storage_server_sans("example", NS, "cluster.local"));
    assert!(server.sans.contains(&"example-etcd-client.vault.svc".to_string()));
    assert!(server.sans.contains(&"*.example-etcd.vault.svc.cluster.local".to_string()));
    assert!(server.server_auth && server.client_auth);

    let peer = summarize(entry(find(&secrets, "example-etcd-peer-tls"), PEER_CERT));
    assert_eq!(peer.subject_cn, "etcd peer");
    assert_eq!(
        peer.sans,
        vec!["*.example-etcd.vault.svc", "*.example-etcd.vault.svc.cluster.local"]
    );
}

#[test]
fn test_static_peer_secret_is_not_generated() {
    let vs = with_static_tls(mock_vault(), Some("my-peer"));
    let secrets = issue_storage_bundles(&vs, "cluster.local").unwrap();
    let names: Vec<String> = secrets.iter().map(|s| s.name_any()).collect();
    assert_eq!(names, vec!["example-etcd-client-tls", "example-etcd-server-tls"]);
}

#[test]
fn test_vault_bundles() {
    let vs = mock_vault();
    let secrets = issue_vault_bundles(&vs).unwrap();
    assert_eq!(secrets.len(), 2);

    let server = find(&secrets, "example-default-vault-server-tls");
    let client = find(&secrets, "example-default-vault-client-tls");
    assert_eq!(keys(server), vec![SERVER_CA, SERVER_CERT, SERVER_KEY]);
    // Clients only ever receive the CA certificate
    assert_eq!(keys(client), vec![CLIENT_TRUST_CA]);
    assert_eq!(entry(client, CLIENT_TRUST_CA), entry(server, SERVER_CA));

    let cert = summarize(entry(server, SERVER_CERT));
    assert_eq!(cert.subject_cn, "vault server");
    assert_eq!(cert.sans, vec!["localhost", "*.vault.pod", "example.vault.svc"]);
    assert!(cert.server_auth);
}

#[test]
fn test_each_run_uses_a_fresh_ca() {
    let vs = mock_vault();
    let first = issue_vault_bundles(&vs).unwrap();
    let second = issue_vault_bundles(&vs).unwrap();
    let ca = |s: &[Secret]| entry(find(s, "example-default-vault-client-tls"), CLIENT_TRUST_CA).to_vec();
    assert_ne!(ca(&first), ca(&second));
}

#[test]
fn test_secrets_are_owned_and_labelled() {
    let vs = mock_vault();
    for secret in issue_storage_bundles(&vs, "cluster.local").unwrap() {
        assert_eq!(secret.namespace().as_deref(), Some(NS));
        assert_eq!(secret.labels(), &selector_labels("example"));
        let owners = secret.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-1");
        assert_eq!(owners[0].kind, "VaultService");
    }
}

#[tokio::test]
async fn test_ensure_tls_is_idempotent() {
    let api = FakeApi::new();
    let vs = mock_vault();

    assert_eq!(ensure_storage_tls(&api, &vs, "cluster.local").await.unwrap(), 3);
    assert_eq!(ensure_vault_tls(&api, &vs).await.unwrap(), 2);
    let writes = api.write_count();

    assert_eq!(ensure_storage_tls(&api, &vs, "cluster.local").await.unwrap(), 0);
    assert_eq!(ensure_vault_tls(&api, &vs).await.unwrap(), 0);
    assert_eq!(api.write_count(), writes);

    let ca = client_trust_ca(&api, &vs).await.unwrap();
    assert!(ca.starts_with("-----BEGIN CERTIFICATE-----"));
}

#[tokio::test]
async fn test_static_vault_tls_is_left_alone() {
    let api = FakeApi::new();
    let vs = with_static_tls(mock_vault(), None);

    assert_eq!(ensure_vault_tls(&api, &vs).await.unwrap(), 0);
    assert_eq!(api.write_count(), 0);

    let err = client_trust_ca(&api, &vs).await.unwrap_err();
    assert!(err.is_not_found());
}

fn stored_entry(api: &FakeApi, name: &str, key: &str) -> Vec<u8> {
    entry(&api.peek::<Secret>(NS, name).unwrap(), key).to_vec()
}

#[test]
fn test_storage_secret_names() {
    let vs = mock_vault();
    assert_eq!(
        storage_secret_names(&vs),
        vec!["example-etcd-client-tls", "example-etcd-server-tls", "example-etcd-peer-tls"]
    );

    let vs = with_static_tls(mock_vault(), Some("my-peer"));
    assert_eq!(
        storage_secret_names(&vs),
        vec!["example-etcd-client-tls", "example-etcd-server-tls"]
    );
}

#[tokio::test]
async fn test_partial_storage_set_is_reissued_under_one_ca() {
    let api = FakeApi::new();
    let vs = mock_vault();
    assert_eq!(ensure_storage_tls(&api, &vs, "cluster.local").await.unwrap(), 3);
    let first_ca = stored_entry(&api, "example-etcd-client-tls", STORAGE_CLIENT_CA);

    // Only the client secret survived an interrupted pass
    api.remove::<Secret>(NS, "example-etcd-server-tls");
    api.remove::<Secret>(NS, "example-etcd-peer-tls");

    assert_eq!(ensure_storage_tls(&api, &vs, "cluster.local").await.unwrap(), 3);
    assert_eq!(api.count::<Secret>(), 3);

    let ca = stored_entry(&api, "example-etcd-client-tls", STORAGE_CLIENT_CA);
    assert_ne!(ca, first_ca);
    assert_eq!(stored_entry(&api, "example-etcd-server-tls", SERVER_CA), ca);
    assert_eq!(stored_entry(&api, "example-etcd-peer-tls", PEER_CA), ca);

    assert_eq!(ensure_storage_tls(&api, &vs, "cluster.local").await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_client_trust_secret_is_reissued() {
    let api = FakeApi::new();
    let vs = mock_vault();
    assert_eq!(ensure_vault_tls(&api, &vs).await.unwrap(), 2);

    api.remove::<Secret>(NS, "example-default-vault-client-tls");
    assert!(client_trust_ca(&api, &vs).await.unwrap_err().is_not_found());

    assert_eq!(ensure_vault_tls(&api, &vs).await.unwrap(), 2);
    let ca = client_trust_ca(&api, &vs).await.unwrap();
    assert_eq!(
        ca.as_bytes(),
        stored_entry(&api, "example-default-vault-server-tls", SERVER_CA).as_slice()
    );
}
