//! Custom Resource Definitions used by the Vault operator
//!
//! `VaultService` is owned by this operator; `EtcdCluster` belongs to the
//! etcd-operator and is only created and read here.

mod etcd;
mod vault_service;

pub use etcd::{
    EtcdCluster, EtcdClusterSpec, EtcdClusterStatus, EtcdMemberSecrets, EtcdMembersStatus,
    EtcdPodPolicy, EtcdStaticTls, EtcdTlsPolicy,
};
pub use vault_service::{
    Defaulted, PodPolicy, StaticTls, TlsPolicy, VaultNodes, VaultService, VaultServicePhase,
    VaultServiceSpec, VaultServiceStatus, DEFAULT_BASE_IMAGE, DEFAULT_VERSION,
};
