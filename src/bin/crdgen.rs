//! Print the VaultService CustomResourceDefinition as YAML
//!
//! `cargo run --bin vault-crdgen > deploy/crd.yaml`

use kube::CustomResourceExt;
use vault_k8s::crd::VaultService;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&VaultService::crd())?);
    Ok(())
}
