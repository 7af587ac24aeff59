//! Builders and upserts for the objects owned by an Agent: config
//! artifact, workspace volumes, and the Deployment with its sidecar
//! topology.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::controllers::types::{Context, Result};
use crate::crds::agent::{Agent, AgentResources, FALLBACK_IMAGE, FALLBACK_MODEL};
use crate::crds::fleet::FleetDefaults;

/// Size of the nix package store volume created when nix tools are requested.
const NIX_STORE_SIZE: &str = "5Gi";

#[must_use]
pub fn config_map_name(agent_name: &str) -> String {
    format!("agent-{agent_name}-config")
}

#[must_use]
pub fn workspace_pvc_name(agent_name: &str) -> String {
    format!("agent-{agent_name}-workspace")
}

#[must_use]
pub fn nix_store_pvc_name(agent_name: &str) -> String {
    format!("agent-{agent_name}-nix-store")
}

/// Directory git-sync checks the arsenal out under, derived from the repo
/// URL basename.
#[must_use]
pub fn arsenal_repo_dir(repo_url: Option<&str>) -> String {
    repo_url
        .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
        .map(|segment| segment.trim_end_matches(".git").to_string())
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "arsenal".to_string())
}

/// Instance labels shared by every object owned by an agent.
#[must_use]
pub fn instance_labels(agent: &Agent) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "agent".to_string());
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        agent.name_any(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "fleet-operator".to_string(),
    );
    labels.insert(
        "agents.platform/domain".to_string(),
        agent.spec.domain.clone(),
    );
    labels
}

fn owner_reference(agent: &Agent) -> OwnerReference {
    OwnerReference {
        api_version: "agents.platform/v1alpha1".to_string(),
        kind: "Agent".to_string(),
        name: agent.name_any(),
        uid: agent.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Resolve the model: spec, then fleet default, then the fallback.
#[must_use]
pub fn resolve_model(agent: &Agent, fleet_defaults: Option<&FleetDefaults>) -> String {
    agent
        .spec
        .model
        .clone()
        .or_else(|| fleet_defaults.and_then(|d| d.model.clone()))
        .unwrap_or_else(|| FALLBACK_MODEL.to_string())
}

/// Resolve the runtime image: spec, then fleet default, then the fallback.
#[must_use]
pub fn resolve_image(agent: &Agent, fleet_defaults: Option<&FleetDefaults>) -> String {
    agent
        .spec
        .image
        .clone()
        .or_else(|| fleet_defaults.and_then(|d| d.image.clone()))
        .unwrap_or_else(|| FALLBACK_IMAGE.to_string())
}

/// mise configuration provisioning the agent's toolchain.
#[must_use]
pub fn generate_mise_toml(agent: &Agent) -> String {
    let mut out = String::new();
    out.push_str("# Generated by fleet-operator\n");
    out.push_str(&format!("# Agent: {}\n", agent.name_any()));
    out.push_str(&format!("# Domain: {}\n\n", agent.spec.domain));

    if let Some(tools) = &agent.spec.tools {
        if !tools.mise.is_empty() {
            out.push_str("[tools]\n");
            for tool in &tools.mise {
                out.push_str(&format!("{tool} = \"latest\"\n"));
            }
        }
    }

    out
}

/// Nix flake building the requested native packages into one environment,
/// cached on the nix-store volume.
#[must_use]
pub fn generate_flake(agent: &Agent, packages: &[String]) -> String {
    let paths = packages.join(" ");
    format!(
        r#"{{
  description = "Tool environment for agent {name}";

  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-24.05";

  outputs = {{ self, nixpkgs }}:
    let
      pkgs = nixpkgs.legacyPackages.x86_64-linux;
    in {{
      packages.x86_64-linux.default = pkgs.buildEnv {{
        name = "agent-tools";
        paths = with pkgs; [ {paths} ];
      }};
    }};
}}
"#,
        name = agent.name_any(),
        paths = paths
    )
}

/// Build the config artifact: skill list, tool manifests and prompt blobs.
#[must_use]
pub fn build_config_map(agent: &Agent) -> ConfigMap {
    let mut data = BTreeMap::new();

    data.insert("AGENT_SKILLS".to_string(), agent.spec.skills.join(","));
    data.insert("mise.toml".to_string(), generate_mise_toml(agent));

    if let Some(tools) = &agent.spec.tools {
        if !tools.nix.is_empty() {
            data.insert("flake.nix".to_string(), generate_flake(agent, &tools.nix));
        }
        if !tools.apt.is_empty() {
            data.insert("apt.txt".to_string(), tools.apt.join("\n"));
        }
    }

    if let Some(prompt) = &agent.spec.prompt {
        if let Some(identity) = &prompt.identity {
            data.insert("SOUL.md".to_string(), identity.clone());
        }
        if let Some(instructions) = &prompt.instructions {
            data.insert("AGENTS.md".to_string(), instructions.clone());
        }
    }

    ConfigMap {
        metadata: kube::core::ObjectMeta {
            name: Some(config_map_name(&agent.name_any())),
            namespace: agent.metadata.namespace.clone(),
            labels: Some(instance_labels(agent)),
            owner_references: Some(vec![owner_reference(agent)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn build_pvc(agent: &Agent, name: &str, size: &str) -> Result<PersistentVolumeClaim> {
    let pvc = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": agent.metadata.namespace,
            "labels": instance_labels(agent),
            "ownerReferences": [owner_reference(agent)]
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {
                "requests": { "storage": size }
            }
        }
    });
    Ok(serde_json::from_value(pvc)?)
}

/// Shell loop run by the skill-filter sidecar: link the selected skill
/// categories out of the synced arsenal, then keep them fresh.
fn skill_filter_script(repo_dir: &str) -> String {
    format!(
        r#"while true; do
  linked=0; total=0
  for category in $(echo "$AGENT_SKILLS" | tr ',' ' '); do
    total=$((total + 1))
    src="/arsenal/{repo_dir}/$category"
    if [ -d "$src" ]; then
      ln -sfn "$src" "/skills/$category"
      linked=$((linked + 1))
    fi
  done
  if [ "$linked" -eq "$total" ] && [ "$total" -gt 0 ]; then
    sleep 60
  else
    sleep 5
  fi
done
"#
    )
}

fn agent_env(agent: &Agent, model: &str) -> Result<Vec<Value>> {
    let task_timeout_ms = i64::from(agent.spec.task_timeout) * 1000;
    let mut env = vec![
        json!({"name": "AGENT_NAME", "value": agent.name_any()}),
        json!({"name": "AGENT_DOMAIN", "value": agent.spec.domain}),
        json!({"name": "MODEL", "value": model}),
        json!({"name": "BUS_URL", "value": agent.spec.bus.url}),
        json!({"name": "SUBSCRIBE_TOPICS", "value": agent.spec.bus.subjects.join(",")}),
        json!({"name": "BUS_STREAM", "value": agent.spec.bus.stream}),
        json!({"name": "BUS_RESULTS_STREAM", "value": agent.spec.bus.results_stream}),
        json!({"name": "BUS_CONSUMER", "value": agent.consumer_name()}),
        json!({"name": "BUS_MAX_DELIVER", "value": agent.spec.bus.max_deliver.to_string()}),
        json!({"name": "MAX_CONCURRENT", "value": agent.spec.concurrency.to_string()}),
        json!({"name": "TASK_TIMEOUT_MS", "value": task_timeout_ms.to_string()}),
    ];

    for var in &agent.spec.env {
        env.push(serde_json::to_value(var)?);
    }

    Ok(env)
}

/// Assemble the Deployment: agent container, skill-filter sidecar and the
/// optional arsenal-sync sidecar, with the volume topology from the spec.
#[allow(clippy::too_many_lines)]
pub fn build_deployment(
    agent: &Agent,
    fleet_defaults: Option<&FleetDefaults>,
) -> Result<Deployment> {
    let name = agent.name_any();
    let labels = instance_labels(agent);
    let cm_name = config_map_name(&name);
    let model = resolve_model(agent, fleet_defaults);
    let image = resolve_image(agent, fleet_defaults);
    let resources = agent.spec.resources.clone().unwrap_or_default();
    let AgentResources { memory, cpu } = resources;

    let workspace_claim = agent
        .spec
        .workspace
        .as_ref()
        .and_then(|w| w.existing_claim.clone())
        .unwrap_or_else(|| workspace_pvc_name(&name));

    let mut volumes = vec![
        json!({"name": "workspace", "persistentVolumeClaim": {"claimName": workspace_claim}}),
        json!({"name": "config", "configMap": {"name": cm_name.clone()}}),
        json!({"name": "arsenal", "emptyDir": {}}),
        json!({"name": "skills", "emptyDir": {}}),
    ];

    let mut agent_mounts = vec![
        json!({"name": "workspace", "mountPath": "/workspace"}),
        json!({"name": "config", "mountPath": "/config", "readOnly": true}),
        json!({"name": "arsenal", "mountPath": "/arsenal"}),
        json!({"name": "skills", "mountPath": "/skills"}),
    ];

    if let Some(vault) = &agent.spec.vault {
        volumes.push(json!({
            "name": "vault",
            "persistentVolumeClaim": {
                "claimName": vault.claim_name,
                "readOnly": vault.read_only
            }
        }));
        agent_mounts.push(json!({
            "name": "vault",
            "mountPath": "/vault",
            "readOnly": vault.read_only
        }));
        for path in &vault.writable_paths {
            agent_mounts.push(json!({
                "name": "vault",
                "mountPath": format!("/vault/{path}"),
                "subPath": path,
                "readOnly": false
            }));
        }
    }

    let has_nix_tools = agent
        .spec
        .tools
        .as_ref()
        .is_some_and(|t| !t.nix.is_empty());
    if has_nix_tools {
        volumes.push(json!({
            "name": "nix-store",
            "persistentVolumeClaim": {"claimName": nix_store_pvc_name(&name)}
        }));
        agent_mounts.push(json!({"name": "nix-store", "mountPath": "/nix"}));
    }

    let container_security = json!({
        "runAsNonRoot": true,
        "allowPrivilegeEscalation": false
    });

    let env = agent_env(agent, &model)?;
    let agent_container = json!({
        "name": "agent",
        "image": image,
        "env": env,
        "envFrom": agent.spec.env_from,
        "resources": {
            "requests": {"memory": "128Mi", "cpu": "50m"},
            "limits": {"memory": memory, "cpu": cpu}
        },
        "volumeMounts": agent_mounts,
        "livenessProbe": {
            "httpGet": {"path": "/health", "port": 3000}
        },
        "readinessProbe": {
            "httpGet": {"path": "/ready", "port": 3000}
        },
        "securityContext": container_security.clone()
    });

    let repo_dir = arsenal_repo_dir(agent.spec.arsenal.as_ref().map(|a| a.repo.as_str()));
    let skill_filter = json!({
        "name": "skill-filter",
        "image": "busybox:1.36",
        "command": ["/bin/sh", "-c"],
        "args": [skill_filter_script(&repo_dir)],
        "env": [
            {"name": "AGENT_SKILLS", "valueFrom": {
                "configMapKeyRef": {"name": cm_name, "key": "AGENT_SKILLS"}
            }},
            {"name": "AGENT_NAME", "value": name.clone()}
        ],
        "resources": {
            "requests": {"memory": "32Mi", "cpu": "10m"},
            "limits": {"memory": "64Mi", "cpu": "50m"}
        },
        "volumeMounts": [
            {"name": "arsenal", "mountPath": "/arsenal", "readOnly": true},
            {"name": "skills", "mountPath": "/skills"}
        ],
        "securityContext": container_security.clone()
    });

    let mut containers = vec![agent_container, skill_filter];

    if let Some(arsenal) = &agent.spec.arsenal {
        containers.push(json!({
            "name": "arsenal-sync",
            "image": arsenal.image,
            "args": [
                format!("--repo={}", arsenal.repo),
                format!("--ref={}", arsenal.git_ref),
                format!("--period={}", arsenal.period),
                "--depth=1",
                "--root=/arsenal",
                format!("--link={repo_dir}")
            ],
            "resources": {
                "requests": {"memory": "32Mi", "cpu": "10m"},
                "limits": {"memory": "128Mi", "cpu": "100m"}
            },
            "volumeMounts": [
                {"name": "arsenal", "mountPath": "/arsenal"}
            ],
            "securityContext": container_security
        }));
    }

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": agent.metadata.namespace,
            "labels": labels.clone(),
            "ownerReferences": [owner_reference(agent)]
        },
        "spec": {
            "replicas": 1,
            "strategy": {"type": "Recreate"},
            "selector": {"matchLabels": labels.clone()},
            "template": {
                "metadata": {
                    "labels": labels,
                    "annotations": {
                        "agents.platform/model": model,
                        "agents.platform/skills": agent.spec.skills.join(","),
                        "agents.platform/domain": agent.spec.domain
                    }
                },
                "spec": {
                    "containers": containers,
                    "volumes": volumes,
                    "securityContext": {
                        "runAsUser": 1000,
                        "runAsGroup": 1000,
                        "fsGroup": 1000,
                        "fsGroupChangePolicy": "OnRootMismatch",
                        "runAsNonRoot": true
                    },
                    "automountServiceAccountToken": false
                }
            }
        }
    });

    Ok(serde_json::from_value(deployment)?)
}

/// Create-or-replace upsert for the agent's owned objects, in the fixed
/// order config -> volumes -> workload.
pub async fn apply_owned_objects(
    agent: &Agent,
    ctx: &Context,
    namespace: &str,
    fleet_defaults: Option<&FleetDefaults>,
) -> Result<()> {
    let name = agent.name_any();

    let configmaps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    let cm = build_config_map(agent);
    upsert_config_map(&configmaps, cm).await?;

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let needs_workspace = agent
        .spec
        .workspace
        .as_ref()
        .is_none_or(|w| w.existing_claim.is_none());
    if needs_workspace {
        let size = agent
            .spec
            .workspace
            .as_ref()
            .map_or_else(|| "1Gi".to_string(), |w| w.size.clone());
        let pvc = build_pvc(agent, &workspace_pvc_name(&name), &size)?;
        ensure_pvc(&pvcs, pvc).await?;
    }
    if agent.spec.tools.as_ref().is_some_and(|t| !t.nix.is_empty()) {
        let pvc = build_pvc(agent, &nix_store_pvc_name(&name), NIX_STORE_SIZE)?;
        ensure_pvc(&pvcs, pvc).await?;
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let deployment = build_deployment(agent, fleet_defaults)?;
    upsert_deployment(&deployments, deployment).await?;

    Ok(())
}

async fn upsert_config_map(api: &Api<ConfigMap>, cm: ConfigMap) -> Result<()> {
    let name = cm.name_any();
    match api.create(&PostParams::default(), &cm).await {
        Ok(_) => {
            info!(configmap = %name, "Created config artifact");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            api.replace(&name, &PostParams::default(), &cm).await?;
            debug!(configmap = %name, "Updated config artifact");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// PVCs are immutable after creation; existing claims are left alone.
async fn ensure_pvc(api: &Api<PersistentVolumeClaim>, pvc: PersistentVolumeClaim) -> Result<()> {
    let name = pvc.name_any();
    match api.get_opt(&name).await? {
        Some(_) => Ok(()),
        None => match api.create(&PostParams::default(), &pvc).await {
            Ok(_) => {
                info!(pvc = %name, "Created volume claim");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(pvc = %name, "Volume claim created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    }
}

async fn upsert_deployment(api: &Api<Deployment>, deployment: Deployment) -> Result<()> {
    let name = deployment.name_any();
    match api.create(&PostParams::default(), &deployment).await {
        Ok(_) => {
            info!(deployment = %name, "Created workload");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            api.replace(&name, &PostParams::default(), &deployment)
                .await?;
            debug!(deployment = %name, "Updated workload");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::agent::AgentSpec;

    fn test_agent() -> Agent {
        let spec: AgentSpec = serde_json::from_value(serde_json::json!({
            "domain": "security",
            "skills": ["recon", "exploit"],
            "bus": {"subjects": ["fleet-a.tasks.security.>"]},
            "tools": {"nix": ["nmap", "whois"], "mise": ["shodan"], "apt": ["curl"]}
        }))
        .unwrap();
        let mut agent = Agent::new("sentinel", spec);
        agent.metadata.namespace = Some("default".to_string());
        agent.metadata.uid = Some("uid-123".to_string());
        agent
    }

    #[test]
    fn config_map_carries_tool_manifests() {
        let agent = test_agent();
        let cm = build_config_map(&agent);
        let data = cm.data.unwrap();

        assert_eq!(data["AGENT_SKILLS"], "recon,exploit");
        assert!(data["mise.toml"].contains("shodan = \"latest\""));
        assert!(data["flake.nix"].contains("nmap whois"));
        assert_eq!(data["apt.txt"], "curl");
    }

    #[test]
    fn config_map_carries_prompt_overrides() {
        let mut agent = test_agent();
        agent.spec.prompt = Some(crate::crds::agent::AgentPrompt {
            identity: Some("You are Lancelot.".to_string()),
            instructions: Some("Be brave.".to_string()),
            config_map_ref: None,
        });
        let data = build_config_map(&agent).data.unwrap();
        assert_eq!(data["SOUL.md"], "You are Lancelot.");
        assert_eq!(data["AGENTS.md"], "Be brave.");
    }

    #[test]
    fn deployment_env_contract() {
        let agent = test_agent();
        let deployment = build_deployment(&agent, None).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, "agent");

        let env = container.env.as_ref().unwrap();
        let get = |name: &str| {
            env.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
                .unwrap_or_default()
        };
        assert_eq!(get("AGENT_NAME"), "sentinel");
        assert_eq!(get("MODEL"), FALLBACK_MODEL);
        assert_eq!(get("SUBSCRIBE_TOPICS"), "fleet-a.tasks.security.>");
        assert_eq!(get("MAX_CONCURRENT"), "2");
        assert_eq!(get("TASK_TIMEOUT_MS"), "120000");
        assert_eq!(get("BUS_CONSUMER"), "agent-sentinel");
    }

    #[test]
    fn deployment_has_sidecar_and_nix_volume() {
        let agent = test_agent();
        let deployment = build_deployment(&agent, None).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();

        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["agent", "skill-filter"]);

        let volumes: Vec<_> = pod
            .volumes
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert!(volumes.contains(&"nix-store".to_string()));
        assert!(volumes.contains(&"arsenal".to_string()));
        assert!(volumes.contains(&"skills".to_string()));

        let security = pod.security_context.unwrap();
        assert_eq!(security.fs_group, Some(1000));
        assert_eq!(security.fs_group_change_policy.as_deref(), Some("OnRootMismatch"));
        assert_eq!(pod.automount_service_account_token, Some(false));
    }

    #[test]
    fn arsenal_sidecar_appears_when_configured() {
        let mut agent = test_agent();
        agent.spec.arsenal = Some(crate::crds::agent::AgentArsenal {
            repo: "https://github.com/fleetops/skill-arsenal.git".to_string(),
            git_ref: "main".to_string(),
            period: "300s".to_string(),
            image: "registry.k8s.io/git-sync/git-sync:v4.4.0".to_string(),
        });
        let deployment = build_deployment(&agent, None).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"arsenal-sync"));
    }

    #[test]
    fn fleet_defaults_fill_unset_model_and_image() {
        let agent = test_agent();
        let defaults = FleetDefaults {
            model: Some("claude-haiku-35-20241022".to_string()),
            image: Some("ghcr.io/fleetops/pi-agent:blue".to_string()),
            ..FleetDefaults::default()
        };
        assert_eq!(resolve_model(&agent, Some(&defaults)), "claude-haiku-35-20241022");
        assert_eq!(resolve_image(&agent, Some(&defaults)), "ghcr.io/fleetops/pi-agent:blue");

        let mut pinned = test_agent();
        pinned.spec.model = Some("claude-opus-4".to_string());
        assert_eq!(resolve_model(&pinned, Some(&defaults)), "claude-opus-4");
    }

    #[test]
    fn arsenal_repo_dir_from_url() {
        assert_eq!(
            arsenal_repo_dir(Some("https://github.com/fleetops/skill-arsenal.git")),
            "skill-arsenal"
        );
        assert_eq!(arsenal_repo_dir(Some("https://example.com/tools/")), "tools");
        assert_eq!(arsenal_repo_dir(None), "arsenal");
    }

    #[test]
    fn vault_mounts_include_writable_subpaths() {
        let mut agent = test_agent();
        agent.spec.vault = Some(crate::crds::agent::AgentVault {
            claim_name: "shared-vault".to_string(),
            read_only: true,
            writable_paths: vec!["Briefings/".to_string()],
        });
        let deployment = build_deployment(&agent, None).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();

        let base = mounts
            .iter()
            .find(|m| m.mount_path == "/vault")
            .expect("base vault mount");
        assert_eq!(base.read_only, Some(true));

        let writable = mounts
            .iter()
            .find(|m| m.mount_path == "/vault/Briefings/")
            .expect("writable mount");
        assert_eq!(writable.read_only, Some(false));
        assert_eq!(writable.sub_path.as_deref(), Some("Briefings/"));
    }
}
