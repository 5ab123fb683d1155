//! Cluster-resident persisted state
//!
//! The last applied spec lives inside the cluster it describes: a ConfigMap
//! holds the sanitized spec and a Secret holds the registry credentials. Every
//! node carries the management label, which later invocations check before
//! touching the cluster.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::kubectl::Kubectl;
use crate::spec::ClusterConfig;
use crate::{
    Error, Result, CLUSTER_LABEL, MANAGED_LABEL, STATE_NAMESPACE, TOOL_VERSION, VERSION_LABEL,
};

/// ConfigMap holding the sanitized spec
pub const CONFIG_MAP: &str = "kubestrap-config";
/// Secret holding registry credentials
pub const SECRET: &str = "kubestrap-credentials";
/// ConfigMap key of the serialized spec
pub const DATA_KEY: &str = "cluster.yaml";

const USERNAME_KEY: &str = "registry-username";
const PASSWORD_KEY: &str = "registry-password";
const DEPLOYED_AT: &str = "kubestrap.io/deployed-at";
const UPDATED_AT: &str = "kubestrap.io/updated-at";

fn labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "kubestrap".to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (VERSION_LABEL.to_string(), TOOL_VERSION.to_string()),
    ])
}

fn metadata(name: &str, cluster: &str, annotation: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(STATE_NAMESPACE.to_string()),
        labels: Some(labels(cluster)),
        annotations: Some(BTreeMap::from([(
            annotation.to_string(),
            Utc::now().to_rfc3339(),
        )])),
        ..Default::default()
    }
}

/// Apply the management and version labels to every node
pub async fn label_nodes(kubectl: &Kubectl, config: &ClusterConfig) -> Result<()> {
    for node in &config.spec.nodes {
        kubectl
            .label_node(&node.hostname, MANAGED_LABEL, "true")
            .await?;
        kubectl
            .label_node(&node.hostname, VERSION_LABEL, TOOL_VERSION)
            .await?;
    }
    debug!(nodes = config.spec.nodes.len(), "nodes labelled");
    Ok(())
}

/// Fail unless every node carries the management label
pub async fn verify_ownership(kubectl: &Kubectl) -> Result<()> {
    let nodes = kubectl.nodes().await?;
    if nodes.is_empty() {
        return Err(Error::ownership("cluster has no nodes"));
    }
    let unmanaged: Vec<&str> = nodes
        .iter()
        .filter(|n| n.labels.get(MANAGED_LABEL).map(String::as_str) != Some("true"))
        .map(|n| n.name.as_str())
        .collect();
    if !unmanaged.is_empty() {
        return Err(Error::ownership(format!(
            "nodes without {MANAGED_LABEL}=true: {}; this cluster was not created by kubestrap",
            unmanaged.join(", ")
        )));
    }
    Ok(())
}

fn config_map(config: &ClusterConfig, annotation: &str) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: metadata(CONFIG_MAP, config.name(), annotation),
        data: Some(BTreeMap::from([(
            DATA_KEY.to_string(),
            serde_yaml::to_string(&config.sanitized())?,
        )])),
        ..Default::default()
    })
}

fn credentials_secret(config: &ClusterConfig) -> Option<Secret> {
    let registry = &config.spec.registry;
    if !registry.has_credentials() {
        return None;
    }
    Some(Secret {
        metadata: metadata(SECRET, config.name(), DEPLOYED_AT),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            (USERNAME_KEY.to_string(), registry.username.clone()),
            (PASSWORD_KEY.to_string(), registry.password.clone()),
        ])),
        ..Default::default()
    })
}

/// Persist `config` for the first time: label nodes, write the ConfigMap and,
/// when there are registry credentials, the Secret
pub async fn save(kubectl: &Kubectl, config: &ClusterConfig) -> Result<()> {
    label_nodes(kubectl, config).await?;
    kubectl
        .apply_resource(&config_map(config, DEPLOYED_AT)?)
        .await?;
    if let Some(secret) = credentials_secret(config) {
        if let Err(e) = kubectl.apply_resource(&secret).await {
            warn!(error = %e, "failed to store registry credentials");
        }
    }
    info!(
        cluster = config.name(),
        configmap = CONFIG_MAP,
        namespace = STATE_NAMESPACE,
        "cluster state saved"
    );
    Ok(())
}

/// Replace the stored spec after a successful reconciliation
pub async fn update(kubectl: &Kubectl, config: &ClusterConfig) -> Result<()> {
    let patch = serde_json::json!({
        "data": { DATA_KEY: serde_yaml::to_string(&config.sanitized())? },
        "metadata": { "annotations": { UPDATED_AT: Utc::now().to_rfc3339() } },
    });
    if kubectl
        .exists(&format!("configmap/{CONFIG_MAP}"), Some(STATE_NAMESPACE))
        .await?
    {
        kubectl
            .merge_patch(
                &format!("configmap/{CONFIG_MAP}"),
                Some(STATE_NAMESPACE),
                &patch,
            )
            .await?;
    } else {
        kubectl
            .apply_resource(&config_map(config, UPDATED_AT)?)
            .await?;
    }
    match credentials_secret(config) {
        Some(secret) => kubectl.apply_resource(&secret).await?,
        None => {
            kubectl
                .delete(&format!("secret/{SECRET}"), Some(STATE_NAMESPACE))
                .await?;
            debug!(secret = SECRET, "registry credentials cleared");
        }
    }
    info!(cluster = config.name(), "cluster state updated");
    Ok(())
}

/// Load the stored spec; `None` when no record exists.
///
/// Registry credentials are overlaid from the Secret when readable; a missing
/// or unreadable Secret leaves them empty.
pub async fn load(kubectl: &Kubectl) -> Result<Option<ClusterConfig>> {
    let config_map: ConfigMap = match kubectl
        .get_json(&format!("configmap/{CONFIG_MAP}"), Some(STATE_NAMESPACE))
        .await
    {
        Ok(cm) => cm,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };

    let raw = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY))
        .ok_or_else(|| Error::state(format!("{CONFIG_MAP} has no {DATA_KEY} key")))?;
    let mut config: ClusterConfig = serde_yaml::from_str(raw)
        .map_err(|e| Error::state(format!("stored spec is unreadable: {e}")))?;

    match kubectl
        .get_json::<Secret>(&format!("secret/{SECRET}"), Some(STATE_NAMESPACE))
        .await
    {
        Ok(secret) => {
            let data = secret.data.unwrap_or_default();
            let field = |key: &str| {
                data.get(key)
                    .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                    .unwrap_or_default()
            };
            config.spec.registry.username = field(USERNAME_KEY);
            config.spec.registry.password = field(PASSWORD_KEY);
        }
        Err(e) => debug!(error = %e, "no stored registry credentials"),
    }
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::load_from_str;
    use crate::testing::{nodes_json, stored_config_json, FakeFleet, Reply};

    fn config() -> ClusterConfig {
        load_from_str(
            r#"
metadata: {name: demo}
spec:
  registry: {username: admin, password: s3cret}
  nodes:
    - {role: master, ip: 10.0.0.1, ssh: {password: pw}}
    - {role: worker, ip: 10.0.0.2, ssh: {password: pw}}
"#,
        )
        .unwrap()
    }

    fn kubectl(fleet: &FakeFleet) -> Kubectl {
        Kubectl::on_control_plane(fleet.channel_for("10.0.0.1"))
    }

    #[tokio::test]
    async fn test_save_strips_secrets_from_configmap() {
        let fleet = FakeFleet::new();
        save(&kubectl(&fleet), &config()).await.unwrap();

        let applies = fleet.applied("10.0.0.1");
        assert_eq!(applies.len(), 2);
        assert!(applies[0].contains("kind: ConfigMap"));
        assert!(applies[0].contains("kubestrap.io/deployed-at"));
        assert!(!applies[0].contains("s3cret"));
        assert!(!applies[0].contains("password: pw"));
        assert!(applies[1].contains("kind: Secret"));
        assert!(applies[1].contains("registry-password: s3cret"));

        assert!(fleet.ran("10.0.0.1", "label node demo-node-01 kubestrap.io/managed=true"));
    }

    #[tokio::test]
    async fn test_registry_password_never_on_a_command_line() {
        let fleet = FakeFleet::new();
        save(&kubectl(&fleet), &config()).await.unwrap();
        update(&kubectl(&fleet), &config()).await.unwrap();

        assert!(fleet.applied("10.0.0.1").iter().any(|m| m.contains("s3cret")));
        let leaked: Vec<String> = fleet
            .commands("10.0.0.1")
            .into_iter()
            .filter(|c| c.contains("s3cret"))
            .collect();
        assert!(leaked.is_empty(), "password in argv: {leaked:?}");
    }

    #[tokio::test]
    async fn test_update_without_credentials_deletes_stale_secret() {
        let fleet = FakeFleet::new();
        let mut config = config();
        config.spec.registry.username.clear();
        config.spec.registry.password.clear();

        update(&kubectl(&fleet), &config).await.unwrap();

        assert!(fleet.ran(
            "10.0.0.1",
            "delete secret/kubestrap-credentials -n kube-system --ignore-not-found"
        ));
        assert!(!fleet.applied("10.0.0.1").iter().any(|m| m.contains("kind: Secret")));
    }

    #[tokio::test]
    async fn test_unmanaged_node_fails_ownership() {
        let fleet = FakeFleet::new();
        fleet.on(
            None,
            "get nodes -o json",
            Reply::Ok(nodes_json(&[("demo-master-01", true), ("stranger", false)])),
        );

        let err = verify_ownership(&kubectl(&fleet)).await.unwrap_err();
        assert!(matches!(err, Error::Ownership(_)));
        assert!(err.to_string().contains("stranger"));
        assert!(!err.to_string().contains("demo-master-01"));
    }

    #[tokio::test]
    async fn test_load_overlays_credentials_best_effort() {
        let fleet = FakeFleet::new();
        fleet.on(
            None,
            "get configmap/kubestrap-config",
            Reply::Ok(stored_config_json(&config())),
        );
        fleet.on(
            None,
            "get secret/kubestrap-credentials",
            Reply::fail("Error from server (NotFound): secrets \"kubestrap-credentials\" not found"),
        );

        let loaded = load(&kubectl(&fleet)).await.unwrap().unwrap();
        assert_eq!(loaded.name(), "demo");
        assert_eq!(loaded.spec.nodes.len(), 2);
        assert!(loaded.spec.registry.username.is_empty());

        // base64("admin") / base64("s3cret")
        let secret = serde_json::json!({
            "apiVersion": "v1", "kind": "Secret",
            "metadata": { "name": SECRET },
            "data": { USERNAME_KEY: "YWRtaW4=", PASSWORD_KEY: "czNjcmV0" },
        });
        fleet.on(None, "get secret/kubestrap-credentials", Reply::Ok(secret.to_string()));
        let loaded = load(&kubectl(&fleet)).await.unwrap().unwrap();
        assert_eq!(loaded.spec.registry.username, "admin");
        assert_eq!(loaded.spec.registry.password, "s3cret");
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let fleet = FakeFleet::new();
        fleet.on(
            None,
            "get configmap/kubestrap-config",
            Reply::fail("Error from server (NotFound): configmaps \"kubestrap-config\" not found"),
        );
        assert!(load(&kubectl(&fleet)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_patches_existing_record() {
        let fleet = FakeFleet::new();
        update(&kubectl(&fleet), &config()).await.unwrap();
        assert!(fleet.ran("10.0.0.1", "patch configmap/kubestrap-config -n kube-system --type=merge"));
        assert!(fleet.ran("10.0.0.1", "kubestrap.io/updated-at"));
    }
}
