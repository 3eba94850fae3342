//! # CRD Generator
//!
//! Emits the CustomResourceDefinition YAML for the `Synapse` resource.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/synapse.yaml
//! # or apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;

use synapse_operator::Synapse;

fn main() {
    match serde_yaml::to_string(&Synapse::crd()) {
        Ok(yaml) => print!("{yaml}"),
        Err(err) => {
            eprintln!("Failed to serialize CRD to YAML: {err}");
            std::process::exit(1);
        }
    }
}
