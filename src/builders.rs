//! Builders for the dependent resources owned by a Synapse instance.
//!
//! Builders are pure functions of the Synapse resource and previously
//! created dependents, with one sanctioned exception: [`synapse_secret`]
//! draws fresh key material, and the reconciler calls it exactly once per
//! Synapse.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, PodSpec,
    PodTemplateSpec, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use crate::homeserver::HomeserverConfig;
use crate::keys::{generate_signing_key, random_string, signing_key_id};
use crate::Synapse;

/// Annotation on the generated ConfigMap holding the fingerprint of the
/// inputs its homeserver.yaml was rendered from.
pub const INPUT_ID_ANNOTATION: &str = "matrix.slrz.net/input-identifier";

/// Image used when the Synapse spec does not name one.
pub const DEFAULT_SYNAPSE_IMAGE: &str = "docker.io/matrixdotorg/synapse:v1.18.0";

/// Secret data keys.
pub const SIGNING_KEY_KEY: &str = "signing-key";
pub const REGISTRATION_SECRET_KEY: &str = "registration-shared-secret";
pub const MACAROON_SECRET_KEY: &str = "macaroon-secret-key";
pub const FORM_SECRET_KEY: &str = "form-secret";

/// ConfigMap data keys, also the filenames mounted into the pod.
pub const HOMESERVER_YAML: &str = "homeserver.yaml";
pub const LOG_CONFIG_FILE: &str = "homeserver.log.config";
const SIGNING_KEY_FILE: &str = "homeserver.signing.key";

pub fn synapse_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "synapse".to_string()),
        ("synapse_cr".to_string(), name.to_string()),
    ])
}

/// Shared metadata for dependents: same name/namespace as the Synapse,
/// labelled, and owned by it so deletion cascades through the store's
/// garbage collector.
fn dependent_meta(synapse: &Synapse) -> ObjectMeta {
    ObjectMeta {
        name: Some(synapse.name_any()),
        namespace: synapse.namespace(),
        labels: Some(synapse_labels(&synapse.name_any())),
        owner_references: synapse.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..ObjectMeta::default()
    }
}

/// Builds the credential Secret for a Synapse instance: a fresh signing key
/// plus three independent 64-character shared secrets.
///
/// Created once per Synapse and never regenerated while the resource
/// exists; regenerating would invalidate every credential the running
/// server has issued.
pub fn synapse_secret(synapse: &Synapse) -> Secret {
    let signing_key = generate_signing_key(&signing_key_id());
    let data = BTreeMap::from([
        (
            SIGNING_KEY_KEY.to_string(),
            ByteString(signing_key.into_bytes()),
        ),
        (
            REGISTRATION_SECRET_KEY.to_string(),
            ByteString(random_string(64).into_bytes()),
        ),
        (
            MACAROON_SECRET_KEY.to_string(),
            ByteString(random_string(64).into_bytes()),
        ),
        (
            FORM_SECRET_KEY.to_string(),
            ByteString(random_string(64).into_bytes()),
        ),
    ]);

    Secret {
        metadata: dependent_meta(synapse),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

fn secret_string(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| String::from_utf8_lossy(&value.0).into_owned())
        .unwrap_or_default()
}

/// Derives the homeserver configuration from a Synapse spec and its
/// credential Secret. Deterministic given identical inputs, which is what
/// makes the fingerprint comparison in the reconciler meaningful.
pub fn homeserver_config(synapse: &Synapse, secret: &Secret) -> HomeserverConfig {
    HomeserverConfig {
        server_name: synapse.spec.server_name.clone(),
        report_stats: synapse.spec.report_stats,
        registration_shared_secret: secret_string(secret, REGISTRATION_SECRET_KEY),
        macaroon_secret_key: secret_string(secret, MACAROON_SECRET_KEY),
        form_secret: secret_string(secret, FORM_SECRET_KEY),
        ..HomeserverConfig::default()
    }
}

/// Builds the ConfigMap holding homeserver.yaml and the (static) logging
/// configuration, annotated with the fingerprint of its generation inputs.
pub fn synapse_config_map(
    synapse: &Synapse,
    secret: &Secret,
) -> Result<ConfigMap, askama::Error> {
    let config = homeserver_config(synapse, secret);
    let fingerprint = config.fingerprint();
    let yaml = config.render()?;

    let mut metadata = dependent_meta(synapse);
    metadata.annotations = Some(BTreeMap::from([(
        INPUT_ID_ANNOTATION.to_string(),
        fingerprint,
    )]));

    Ok(ConfigMap {
        metadata,
        data: Some(BTreeMap::from([
            (HOMESERVER_YAML.to_string(), yaml),
            (LOG_CONFIG_FILE.to_string(), log_config().to_string()),
        ])),
        ..ConfigMap::default()
    })
}

/// Builds the single-replica Deployment running the Synapse container with
/// the credential Secret and rendered configuration mounted read-only next
/// to a writable data volume.
///
/// TODO: a spec.image change after initial creation is not applied to the
/// existing Deployment; in-place workload updates need their own update
/// semantics before we can wire them in here.
pub fn synapse_deployment(synapse: &Synapse, secret: &Secret, config_map: &ConfigMap) -> Deployment {
    let labels = synapse_labels(&synapse.name_any());
    let image = synapse
        .spec
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_SYNAPSE_IMAGE.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(synapse.name_any()),
            namespace: synapse.namespace(),
            owner_references: synapse.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    volumes: Some(synapse_volumes(secret, config_map)),
                    containers: vec![Container {
                        name: "synapse".to_string(),
                        image: Some(image),
                        ports: Some(vec![ContainerPort {
                            container_port: 8008,
                            name: Some("http".to_string()),
                            ..ContainerPort::default()
                        }]),
                        volume_mounts: Some(synapse_volume_mounts()),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn synapse_volumes(secret: &Secret, config_map: &ConfigMap) -> Vec<Volume> {
    vec![
        Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
        Volume {
            name: "secrets".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: secret.metadata.name.clone(),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.metadata.name.clone().unwrap_or_default(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
    ]
}

fn synapse_volume_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: "config".to_string(),
            mount_path: format!("/data/{HOMESERVER_YAML}"),
            sub_path: Some(HOMESERVER_YAML.to_string()),
            read_only: Some(true),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: "config".to_string(),
            mount_path: format!("/data/{LOG_CONFIG_FILE}"),
            sub_path: Some(LOG_CONFIG_FILE.to_string()),
            read_only: Some(true),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: "secrets".to_string(),
            mount_path: format!("/data/{SIGNING_KEY_FILE}"),
            sub_path: Some(SIGNING_KEY_KEY.to_string()),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    ]
}

/// Static logging configuration for now.
fn log_config() -> &'static str {
    r#"version: 1

formatters:
  precise:
   format: '%(asctime)s - %(name)s - %(lineno)d - %(levelname)s - %(request)s - %(message)s'

filters:
  context:
    (): synapse.logging.context.LoggingContextFilter
    request: ""

handlers:
  console:
    class: logging.StreamHandler
    formatter: precise
    filters: [context]

loggers:
    synapse.storage.SQL:
        # beware: increasing this to DEBUG will make synapse log sensitive
        # information such as access tokens.
        level: INFO

root:
    level: INFO
    handlers: [console]

disable_existing_loggers: false
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SynapseSpec;

    fn test_synapse() -> Synapse {
        let mut synapse = Synapse::new(
            "example",
            SynapseSpec {
                server_name: "example.com".to_string(),
                report_stats: true,
                image: None,
            },
        );
        synapse.metadata.namespace = Some("default".to_string());
        synapse.metadata.uid = Some("1234-5678".to_string());
        synapse
    }

    #[test]
    fn secret_holds_signing_key_and_three_secrets() {
        let secret = synapse_secret(&test_synapse());
        let data = secret.data.expect("secret data");
        assert_eq!(data.len(), 4);

        let signing_key = String::from_utf8(data[SIGNING_KEY_KEY].0.clone()).unwrap();
        assert!(signing_key.starts_with("ed25519 a_"));
        for key in [REGISTRATION_SECRET_KEY, MACAROON_SECRET_KEY, FORM_SECRET_KEY] {
            assert_eq!(data[key].0.len(), 64, "{key} should be 64 characters");
        }
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
    }

    #[test]
    fn dependents_carry_an_owner_reference() {
        let synapse = test_synapse();
        let secret = synapse_secret(&synapse);
        let orefs = secret.metadata.owner_references.expect("owner references");
        assert_eq!(orefs.len(), 1);
        assert_eq!(orefs[0].kind, "Synapse");
        assert_eq!(orefs[0].name, "example");
        assert_eq!(orefs[0].controller, Some(true));
    }

    #[test]
    fn config_map_is_annotated_with_its_input_fingerprint() {
        let synapse = test_synapse();
        let secret = synapse_secret(&synapse);
        let config_map = synapse_config_map(&synapse, &secret).expect("config map");

        let want = homeserver_config(&synapse, &secret).fingerprint();
        let annotations = config_map.metadata.annotations.expect("annotations");
        assert_eq!(annotations[INPUT_ID_ANNOTATION], want);

        let data = config_map.data.expect("config map data");
        assert!(data[HOMESERVER_YAML].contains("server_name: \"example.com\""));
        assert!(data.contains_key(LOG_CONFIG_FILE));
    }

    #[test]
    fn deployment_mounts_config_and_secrets_read_only() {
        let synapse = test_synapse();
        let secret = synapse_secret(&synapse);
        let config_map = synapse_config_map(&synapse, &secret).expect("config map");
        let deployment = synapse_deployment(&synapse, &secret, &config_map);

        let spec = deployment.spec.expect("deployment spec");
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.expect("pod spec");
        assert_eq!(pod.containers.len(), 1);
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_SYNAPSE_IMAGE));

        let mounts = container.volume_mounts.as_ref().expect("volume mounts");
        assert_eq!(mounts.len(), 4);
        let writable: Vec<_> = mounts
            .iter()
            .filter(|m| !m.read_only.unwrap_or(false))
            .collect();
        assert_eq!(writable.len(), 1);
        assert_eq!(writable[0].mount_path, "/data");
    }

    #[test]
    fn deployment_uses_the_spec_image_when_set() {
        let mut synapse = test_synapse();
        synapse.spec.image = Some("docker.io/matrixdotorg/synapse:v1.19.0".to_string());
        let secret = synapse_secret(&synapse);
        let config_map = synapse_config_map(&synapse, &secret).expect("config map");
        let deployment = synapse_deployment(&synapse, &secret, &config_map);

        let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone();
        assert_eq!(image.as_deref(), Some("docker.io/matrixdotorg/synapse:v1.19.0"));
    }
}
