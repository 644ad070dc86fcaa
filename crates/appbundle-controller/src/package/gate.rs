//! Wait-gate synthesis
//!
//! A packaged component's resources are rendered by Porch and synced by the
//! GitOps engine, so the engine cannot watch them directly. Instead the
//! PackageVariant pipeline ends with a Starlark function that appends a
//! Sync-hook Job to the rendered package. The Job runs `kubectl rollout
//! status` against every workload in the package, holding the sync at the
//! gate wave until they have rolled out.
//!
//! The script is rendered with minijinja using `${ ... }` for values so the
//! Starlark dict literals in the template need no escaping.

use std::collections::BTreeMap;
use std::time::Duration;

use minijinja::syntax::SyntaxConfig;
use minijinja::{context, Environment, ErrorKind, UndefinedBehavior};
use serde_json::{json, Value};

use appbundle_common::{Error, HOOK_ANNOTATION, HOOK_DELETE_POLICY_ANNOTATION, SYNC_WAVE_ANNOTATION};

use super::variant::dns1123_label;

/// Label marking resources that belong to a wait gate
pub const GATE_LABEL_KEY: &str = "app.example.com/gate";

/// Hook phase the gate Job runs in
pub const GATE_HOOK: &str = "Sync";

/// Hook delete policy for the gate resources
pub const GATE_HOOK_DELETE_POLICY: &str = "BeforeHookCreation,HookSucceeded";

/// Default image providing `kubectl`
pub const DEFAULT_GATE_IMAGE: &str = "bitnami/kubectl:latest";

/// Default `--timeout` for each rollout check
pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default sleep when the package has no recognizable workload
pub const DEFAULT_GATE_FALLBACK_SLEEP: Duration = Duration::from_secs(30);

const GATE_SCRIPT_TEMPLATE: &str = r##"# Wait gate ${ name } (sync wave ${ wave })
# Appends a Sync hook Job that blocks until the package's workloads roll out.

GATE_LABEL = ${ gate_label | starlark }
ROLLOUT_KINDS = {"Deployment": "deployment", "StatefulSet": "statefulset", "DaemonSet": "daemonset"}
DEFAULT_NAMESPACE = ${ namespace | starlark }
ROLLOUT_TIMEOUT = ${ timeout_secs }
FALLBACK_SLEEP = ${ fallback_sleep_secs }

def is_gate(resource):
    labels = (resource.get("metadata") or {}).get("labels") or {}
    return labels.get(GATE_LABEL) == "true"

def rollout_commands(items):
    commands = []
    for resource in items:
        kind = resource.get("kind", "")
        if kind not in ROLLOUT_KINDS:
            continue
        metadata = resource.get("metadata") or {}
        name = metadata.get("name", "")
        if name == "":
            continue
        namespace = metadata.get("namespace") or DEFAULT_NAMESPACE
        commands.append("kubectl rollout status %s/%s -n %s --timeout=%ds" % (ROLLOUT_KINDS[kind], name, namespace, ROLLOUT_TIMEOUT))
    return commands

def gate_command(items):
    commands = rollout_commands(items)
    if len(commands) == 0:
        return "sleep %d" % FALLBACK_SLEEP
    return " && ".join(commands)

def main():
    items = [r for r in ctx.resource_list["items"] if not is_gate(r)]
    job = ${ job | starlark }
    job["spec"]["template"]["spec"]["containers"][0]["command"] = ["/bin/sh", "-c", gate_command(items)]
    ctx.resource_list["items"] = items + [
        ${ service_account | starlark },
        ${ cluster_role | starlark },
        ${ cluster_role_binding | starlark },
        job,
    ]

main()
"##;

/// Operator-level gate settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateConfig {
    /// Image providing `kubectl`
    pub image: String,
    /// `--timeout` for each rollout check
    pub timeout: Duration,
    /// Sleep used when no workload is recognized
    pub fallback_sleep: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_GATE_IMAGE.to_string(),
            timeout: DEFAULT_GATE_TIMEOUT,
            fallback_sleep: DEFAULT_GATE_FALLBACK_SLEEP,
        }
    }
}

/// Inputs for one component's wait gate
#[derive(Clone, Debug)]
pub struct Gate {
    /// Name of the gate Job and ServiceAccount
    pub name: String,
    /// Namespace the gate runs in, also assumed for workloads without one
    pub namespace: String,
    /// Sync wave of the gate resources
    pub wave: i64,
    /// Image providing `kubectl`
    pub image: String,
    /// `--timeout` for each rollout check
    pub timeout: Duration,
    /// Sleep used when no workload is recognized
    pub fallback_sleep: Duration,
    /// Tracking labels copied onto the gate resources
    pub labels: BTreeMap<String, String>,
}

impl Gate {
    fn hook_metadata(&self, name: &str, namespace: Option<&str>) -> Value {
        let mut labels = self.labels.clone();
        labels.insert(GATE_LABEL_KEY.to_string(), "true".to_string());
        let mut metadata = json!({
            "name": name,
            "labels": labels,
            "annotations": {
                HOOK_ANNOTATION: GATE_HOOK,
                HOOK_DELETE_POLICY_ANNOTATION: GATE_HOOK_DELETE_POLICY,
                SYNC_WAVE_ANNOTATION: self.wave.to_string(),
            }
        });
        if let Some(ns) = namespace {
            metadata["namespace"] = json!(ns);
        }
        metadata
    }

    /// Cluster-wide name for the gate's RBAC objects
    fn cluster_role_name(&self) -> String {
        dns1123_label(&format!("{}-{}", self.namespace, self.name))
    }

    fn service_account(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": self.hook_metadata(&self.name, Some(&self.namespace)),
        })
    }

    fn cluster_role(&self) -> Value {
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": self.hook_metadata(&self.cluster_role_name(), None),
            "rules": [
                {
                    "apiGroups": ["apps"],
                    "resources": ["deployments", "statefulsets", "daemonsets", "replicasets", "controllerrevisions"],
                    "verbs": ["get", "list", "watch"]
                },
                {
                    "apiGroups": [""],
                    "resources": ["pods"],
                    "verbs": ["get", "list", "watch"]
                }
            ]
        })
    }

    fn cluster_role_binding(&self) -> Value {
        let role = self.cluster_role_name();
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": self.hook_metadata(&role, None),
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": role
            },
            "subjects": [
                {"kind": "ServiceAccount", "name": self.name, "namespace": self.namespace}
            ]
        })
    }

    fn job(&self) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": self.hook_metadata(&self.name, Some(&self.namespace)),
            "spec": {
                "backoffLimit": 2,
                "template": {
                    "metadata": {"labels": {GATE_LABEL_KEY: "true"}},
                    "spec": {
                        "serviceAccountName": self.name,
                        "restartPolicy": "Never",
                        "containers": [
                            {"name": "gate", "image": self.image}
                        ]
                    }
                }
            }
        })
    }
}

/// Render a JSON value as a Starlark literal
pub fn to_starlark(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_starlark).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", Value::String(k.clone()), to_starlark(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

fn starlark_filter(value: minijinja::Value) -> Result<String, minijinja::Error> {
    let json = serde_json::to_value(&value)
        .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(to_starlark(&json))
}

fn environment() -> Result<Environment<'static>, minijinja::Error> {
    let syntax = SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .block_delimiters("{%", "%}")
        .comment_delimiters("{#", "#}")
        .build()?;

    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("starlark", starlark_filter);
    Ok(env)
}

/// Build the Starlark source for a gate
///
/// Pure: the same gate always renders the same script.
pub fn build_gate_script(gate: &Gate) -> Result<String, Error> {
    let render = || -> Result<String, minijinja::Error> {
        environment()?.render_str(
            GATE_SCRIPT_TEMPLATE,
            context! {
                name => gate.name,
                wave => gate.wave,
                gate_label => GATE_LABEL_KEY,
                namespace => gate.namespace,
                timeout_secs => gate.timeout.as_secs(),
                fallback_sleep_secs => gate.fallback_sleep.as_secs(),
                job => gate.job(),
                service_account => gate.service_account(),
                cluster_role => gate.cluster_role(),
                cluster_role_binding => gate.cluster_role_binding(),
            },
        )
    };
    render().map_err(|e| Error::package(&gate.name, format!("failed to render gate script: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> Gate {
        Gate {
            name: "shop-app-web-gate".to_string(),
            namespace: "shop".to_string(),
            wave: 199,
            image: DEFAULT_GATE_IMAGE.to_string(),
            timeout: DEFAULT_GATE_TIMEOUT,
            fallback_sleep: DEFAULT_GATE_FALLBACK_SLEEP,
            labels: BTreeMap::from([("app.example.com/appbundle".to_string(), "shop".to_string())]),
        }
    }

    #[test]
    fn starlark_literals() {
        assert_eq!(to_starlark(&json!(null)), "None");
        assert_eq!(to_starlark(&json!(true)), "True");
        assert_eq!(to_starlark(&json!([1, "a", false])), r#"[1, "a", False]"#);
        assert_eq!(
            to_starlark(&json!({"a": {"b": "quote \" here"}})),
            r#"{"a": {"b": "quote \" here"}}"#
        );
    }

    #[test]
    fn script_scans_rendered_items() {
        let script = build_gate_script(&gate()).unwrap();
        assert!(script.contains(r#"ctx.resource_list["items"]"#));
        assert!(script.contains(r#""Deployment": "deployment""#));
        assert!(script.contains(r#""StatefulSet": "statefulset""#));
        assert!(script.contains(r#""DaemonSet": "daemonset""#));
        assert!(script.contains("kubectl rollout status %s/%s -n %s --timeout=%ds"));
        assert!(script.contains(r#"" && ".join(commands)"#));
        assert!(script.contains("ROLLOUT_TIMEOUT = 300"));
        assert!(script.contains(r#"DEFAULT_NAMESPACE = "shop""#));
    }

    #[test]
    fn script_appends_gate_job_with_hook_annotations() {
        let script = build_gate_script(&gate()).unwrap();
        assert!(script.contains(r#""kind": "Job""#));
        assert!(script.contains(r#""kind": "ServiceAccount""#));
        assert!(script.contains(r#""kind": "ClusterRole""#));
        assert!(script.contains(r#""kind": "ClusterRoleBinding""#));
        assert!(script.contains(r#""argocd.argoproj.io/hook": "Sync""#));
        assert!(script.contains(
            r#""argocd.argoproj.io/hook-delete-policy": "BeforeHookCreation,HookSucceeded""#
        ));
        assert!(script.contains(r#""argocd.argoproj.io/sync-wave": "199""#));
        assert!(script.contains(r#""image": "bitnami/kubectl:latest""#));
    }

    #[test]
    fn script_falls_back_to_sleep_without_workloads() {
        let script = build_gate_script(&gate()).unwrap();
        assert!(script.contains("FALLBACK_SLEEP = 30"));
        assert!(script.contains(r#"return "sleep %d" % FALLBACK_SLEEP"#));
    }

    #[test]
    fn script_has_no_unrendered_placeholders() {
        let script = build_gate_script(&gate()).unwrap();
        assert!(!script.contains("${"));
        assert!(script.trim_end().ends_with("main()"));
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(
            build_gate_script(&gate()).unwrap(),
            build_gate_script(&gate()).unwrap()
        );
    }

    #[test]
    fn cluster_role_name_is_namespaced() {
        let g = gate();
        assert_eq!(g.cluster_role_name(), "shop-shop-app-web-gate");
        let binding = g.cluster_role_binding();
        assert_eq!(binding["subjects"][0]["namespace"], "shop");
        assert_eq!(binding["roleRef"]["name"], "shop-shop-app-web-gate");
    }
}
