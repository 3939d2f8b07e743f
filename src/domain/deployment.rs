// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Deployment directives and user-input configuration.
//
// A broker declares what a node should run either as a business policy
// (one service, several candidate versions) or as a pattern (a list of
// service references). Services declare typed input variables; the node
// and the directive each carry bindings for them, addressed by
// (org, url, version range, arch) and merged directive-first.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::version::{is_version_string, VersionError, VersionRange};

/// Architecture wildcard accepted wherever a concrete arch may appear.
pub const ARCH_WILDCARD: &str = "*";

pub fn is_arch_wildcard(arch: &str) -> bool {
    arch.is_empty() || arch == ARCH_WILDCARD
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// One candidate version of a referenced service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadChoice {
    pub version: String,
}

/// A service reference inside a pattern (and the normalized form a business
/// policy reduces to): which versions of `(org, url)` may run on `arch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    #[serde(rename = "serviceUrl")]
    pub service_url: String,
    #[serde(rename = "serviceOrgid")]
    pub service_org: String,
    #[serde(rename = "serviceArch")]
    pub service_arch: String,
    #[serde(rename = "serviceVersions")]
    pub service_versions: Vec<WorkloadChoice>,
}

/// The service triple a business policy deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyService {
    pub name: String,
    pub org: String,
    pub arch: String,
    #[serde(rename = "serviceVersions")]
    pub service_versions: Vec<WorkloadChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessPolicy {
    pub label: String,
    pub service: PolicyService,
    #[serde(rename = "userInput", default)]
    pub user_input: Vec<UserInputBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFile {
    #[serde(default)]
    pub org: String,
    pub label: String,
    #[serde(default)]
    pub services: Vec<ServiceReference>,
    #[serde(rename = "userInput", default)]
    pub user_input: Vec<UserInputBinding>,
}

impl BusinessPolicy {
    /// The service references this policy yields for a node of `node_arch`,
    /// wildcard arches substituted, references without declared versions
    /// dropped.
    pub fn service_references(&self, node_arch: &str) -> Vec<ServiceReference> {
        let mut arch = self.service.arch.clone();
        if !node_arch.is_empty() {
            if is_arch_wildcard(&arch) {
                arch = node_arch.to_string();
            } else if arch != node_arch {
                return Vec::new();
            }
        }
        if self.service.service_versions.is_empty() {
            return Vec::new();
        }
        vec![ServiceReference {
            service_url: self.service.name.clone(),
            service_org: self.service.org.clone(),
            service_arch: arch,
            service_versions: self.service.service_versions.clone(),
        }]
    }
}

impl PatternFile {
    /// Same extraction for a pattern: every reference matching the node
    /// arch, wildcards substituted.
    pub fn service_references(&self, node_arch: &str) -> Vec<ServiceReference> {
        let mut refs = Vec::new();
        for svc in &self.services {
            let mut svc = svc.clone();
            if !node_arch.is_empty() {
                if is_arch_wildcard(&svc.service_arch) {
                    svc.service_arch = node_arch.to_string();
                } else if svc.service_arch != node_arch {
                    continue;
                }
            }
            if !svc.service_versions.is_empty() {
                refs.push(svc);
            }
        }
        refs
    }
}

// ---------------------------------------------------------------------------
// Service definitions
// ---------------------------------------------------------------------------

/// A dependency edge in a service definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub url: String,
    pub org: String,
    /// Version or version range the parent accepts.
    pub version: String,
    pub arch: String,
}

/// The declared type of a user-input variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "boolean")]
    Bool,
    #[serde(rename = "list of strings")]
    StringList,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "boolean",
            Self::StringList => "list of strings",
        }
    }

    /// Whether `value` parses as this type. String-encoded numerics and
    /// booleans are accepted, matching what launch environments can carry.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            Self::String => value.is_string(),
            Self::Int => match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            },
            Self::Float => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            Self::Bool => match value {
                Value::Bool(_) => true,
                Value::String(s) => matches!(s.trim(), "true" | "false"),
                _ => false,
            },
            Self::StringList => match value {
                Value::Array(items) => items.iter().all(|i| i.is_string()),
                _ => false,
            },
        }
    }
}

/// One declared input variable of a service. An empty `default_value`
/// means the variable must be supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(rename = "defaultValue", default)]
    pub default_value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

/// Capability set shared by every representation of a service definition.
pub trait ServiceModel: Send + Sync {
    fn org(&self) -> &str;
    fn url(&self) -> &str;
    fn version(&self) -> &str;
    fn arch(&self) -> &str;
    fn required_services(&self) -> &[ServiceDependency];
    fn user_inputs(&self) -> &[InputSchema];

    /// True when at least one declared variable has no default, so a
    /// binding must exist for the service to launch.
    fn needs_user_input(&self) -> bool {
        self.user_inputs()
            .iter()
            .any(|ui| !ui.name.is_empty() && ui.default_value.is_empty())
    }
}

/// A service definition resolved from the service catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub org: String,
    pub url: String,
    pub version: String,
    pub arch: String,
    #[serde(rename = "requiredServices", default)]
    pub required_services: Vec<ServiceDependency>,
    #[serde(rename = "userInput", default)]
    pub user_inputs: Vec<InputSchema>,
}

impl ServiceModel for ServiceDefinition {
    fn org(&self) -> &str {
        &self.org
    }
    fn url(&self) -> &str {
        &self.url
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn arch(&self) -> &str {
        &self.arch
    }
    fn required_services(&self) -> &[ServiceDependency] {
        &self.required_services
    }
    fn user_inputs(&self) -> &[InputSchema] {
        &self.user_inputs
    }
}

/// A service definition supplied inline by the caller instead of fetched.
/// The org may be blank until matched against a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFile {
    #[serde(default)]
    pub org: String,
    pub url: String,
    pub version: String,
    pub arch: String,
    #[serde(rename = "requiredServices", default)]
    pub required_services: Vec<ServiceDependency>,
    #[serde(rename = "userInput", default)]
    pub user_inputs: Vec<InputSchema>,
}

impl ServiceModel for ServiceFile {
    fn org(&self) -> &str {
        &self.org
    }
    fn url(&self) -> &str {
        &self.url
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn arch(&self) -> &str {
        &self.arch
    }
    fn required_services(&self) -> &[ServiceDependency] {
        &self.required_services
    }
    fn user_inputs(&self) -> &[InputSchema] {
        &self.user_inputs
    }
}

/// A resolved service together with where it came from. The variant tag is
/// kept explicit so callers can tell user-supplied payloads from catalog
/// lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResolvedService {
    Inline(ServiceFile),
    Fetched(ServiceDefinition),
}

impl ResolvedService {
    pub fn as_model(&self) -> &dyn ServiceModel {
        match self {
            Self::Inline(s) => s,
            Self::Fetched(s) => s,
        }
    }
}

/// `org/url_version_arch`, the id form used in verdict maps and catalogs.
pub fn service_id(org: &str, url: &str, version: &str, arch: &str) -> String {
    format!("{}/{}_{}_{}", org, url.replace('/', "-"), version, arch)
}

/// Strip the trailing `_arch` component from a service id.
pub fn service_id_without_arch(id: &str) -> &str {
    match id.rfind('_') {
        Some(pos) => &id[..pos],
        None => id,
    }
}

// ---------------------------------------------------------------------------
// User-input bindings
// ---------------------------------------------------------------------------

/// A single bound variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputValue {
    pub name: String,
    pub value: serde_json::Value,
}

/// Values for one service's variables, addressed by service coordinates.
/// An empty version range applies to all versions; an empty arch to all
/// arches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInputBinding {
    #[serde(rename = "serviceOrgid")]
    pub service_org: String,
    #[serde(rename = "serviceUrl")]
    pub service_url: String,
    #[serde(rename = "serviceVersionRange", default)]
    pub service_version_range: String,
    #[serde(rename = "serviceArch", default)]
    pub service_arch: String,
    #[serde(default)]
    pub inputs: Vec<InputValue>,
}

impl UserInputBinding {
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.inputs.iter().find(|i| i.name == name).map(|i| &i.value)
    }
}

/// Find the binding addressing `(org, url, version, arch)` in `bindings`,
/// honoring wildcard arch and the empty-range-means-all rule.
pub fn find_user_input<'a>(
    url: &str,
    org: &str,
    version: &str,
    arch: &str,
    bindings: &'a [UserInputBinding],
) -> Result<Option<&'a UserInputBinding>, VersionError> {
    for binding in bindings {
        if binding.service_url != url || binding.service_org != org {
            continue;
        }
        if !is_arch_wildcard(&binding.service_arch) && binding.service_arch != arch {
            continue;
        }
        let range = if binding.service_version_range.is_empty() {
            VersionRange::all()
        } else {
            VersionRange::parse(&binding.service_version_range)?
        };
        if version.is_empty() || range.includes_str(version)? {
            return Ok(Some(binding));
        }
    }
    Ok(None)
}

/// Merge two bindings for the same service: every value in `primary` wins,
/// `secondary` fills the remaining holes.
pub fn merge_user_input(
    primary: &UserInputBinding,
    secondary: &UserInputBinding,
) -> UserInputBinding {
    let mut merged = primary.clone();
    for input in &secondary.inputs {
        if merged.get(&input.name).is_none() {
            merged.inputs.push(input.clone());
        }
    }
    merged
}

/// Render a merged binding as the environment fragment a workload sees.
/// List values join with commas; scalars print bare.
pub fn binding_to_env(binding: &UserInputBinding) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for input in &binding.inputs {
        env.insert(input.name.clone(), value_to_env(&input.value));
    }
    env
}

fn value_to_env(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_env)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Structural validation applied to inline service definitions before they
/// participate in a compatibility check.
pub fn validate_service_file(svc: &ServiceFile) -> Result<(), String> {
    if svc.url.is_empty() {
        return Err("URL must be specified in the service definition.".to_string());
    }
    if svc.version.is_empty() {
        return Err(format!(
            "Version must be specified in the service definition for service {}.",
            svc.url
        ));
    }
    if !is_version_string(&svc.version) {
        return Err(format!(
            "Invalid version format {} for service {}.",
            svc.version, svc.url
        ));
    }
    if svc.arch.is_empty() {
        return Err(format!(
            "Arch must be specified in the service definition for service {}.",
            svc.url
        ));
    }
    if svc.org.is_empty() {
        return Err(format!(
            "Org must be specified in the service definition for service {}.",
            svc.url
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding(org: &str, url: &str, range: &str, arch: &str, inputs: &[(&str, serde_json::Value)]) -> UserInputBinding {
        UserInputBinding {
            service_org: org.to_string(),
            service_url: url.to_string(),
            service_version_range: range.to_string(),
            service_arch: arch.to_string(),
            inputs: inputs
                .iter()
                .map(|(n, v)| InputValue {
                    name: n.to_string(),
                    value: v.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn type_checking_per_declared_type() {
        assert!(InputType::Int.accepts(&json!(42)));
        assert!(InputType::Int.accepts(&json!("42")));
        assert!(!InputType::Int.accepts(&json!("4.2")));
        assert!(!InputType::Int.accepts(&json!(4.2)));
        assert!(InputType::Float.accepts(&json!(4.2)));
        assert!(InputType::Float.accepts(&json!("4.2")));
        assert!(InputType::Bool.accepts(&json!(true)));
        assert!(InputType::Bool.accepts(&json!("false")));
        assert!(!InputType::Bool.accepts(&json!("yes")));
        assert!(InputType::String.accepts(&json!("x")));
        assert!(!InputType::String.accepts(&json!(1)));
        assert!(InputType::StringList.accepts(&json!(["a", "b"])));
        assert!(!InputType::StringList.accepts(&json!([1, 2])));
    }

    #[test]
    fn find_binding_by_coordinates() {
        let bindings = vec![
            binding("e2edev", "netspeed", "[1.0.0,2.0.0)", "amd64", &[("k", json!("a"))]),
            binding("e2edev", "netspeed", "2.0.0", "amd64", &[("k", json!("b"))]),
        ];
        let hit = find_user_input("netspeed", "e2edev", "1.5.0", "amd64", &bindings)
            .unwrap()
            .unwrap();
        assert_eq!(hit.get("k"), Some(&json!("a")));

        let hit = find_user_input("netspeed", "e2edev", "2.1.0", "amd64", &bindings)
            .unwrap()
            .unwrap();
        assert_eq!(hit.get("k"), Some(&json!("b")));

        assert!(find_user_input("netspeed", "e2edev", "1.5.0", "arm64", &bindings)
            .unwrap()
            .is_none());
        assert!(find_user_input("other", "e2edev", "1.5.0", "amd64", &bindings)
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_range_and_arch_match_everything() {
        let bindings = vec![binding("org", "svc", "", "", &[("k", json!("v"))])];
        assert!(find_user_input("svc", "org", "9.9.9", "s390x", &bindings)
            .unwrap()
            .is_some());
    }

    #[test]
    fn merge_primary_wins() {
        let directive = binding("o", "s", "", "", &[("k", json!("a"))]);
        let node = binding("o", "s", "", "", &[("k", json!("b")), ("j", json!("c"))]);
        let merged = merge_user_input(&directive, &node);
        assert_eq!(merged.get("k"), Some(&json!("a")));
        assert_eq!(merged.get("j"), Some(&json!("c")));
        assert_eq!(merged.inputs.len(), 2);
    }

    #[test]
    fn business_policy_reference_substitutes_node_arch() {
        let policy = BusinessPolicy {
            label: "pol".to_string(),
            service: PolicyService {
                name: "svc".to_string(),
                org: "org".to_string(),
                arch: "*".to_string(),
                service_versions: vec![WorkloadChoice {
                    version: "1.0.0".to_string(),
                }],
            },
            user_input: vec![],
        };
        let refs = policy.service_references("amd64");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].service_arch, "amd64");

        let mut mismatched = policy.clone();
        mismatched.service.arch = "arm64".to_string();
        assert!(mismatched.service_references("amd64").is_empty());
    }

    #[test]
    fn pattern_references_filter_by_arch() {
        let pattern = PatternFile {
            org: "org".to_string(),
            label: "pat".to_string(),
            services: vec![
                ServiceReference {
                    service_url: "a".to_string(),
                    service_org: "org".to_string(),
                    service_arch: "amd64".to_string(),
                    service_versions: vec![WorkloadChoice {
                        version: "1.0.0".to_string(),
                    }],
                },
                ServiceReference {
                    service_url: "b".to_string(),
                    service_org: "org".to_string(),
                    service_arch: "arm64".to_string(),
                    service_versions: vec![WorkloadChoice {
                        version: "1.0.0".to_string(),
                    }],
                },
                ServiceReference {
                    service_url: "c".to_string(),
                    service_org: "org".to_string(),
                    service_arch: "amd64".to_string(),
                    service_versions: vec![],
                },
            ],
            user_input: vec![],
        };
        let refs = pattern.service_references("amd64");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].service_url, "a");
    }

    #[test]
    fn needs_user_input_only_without_default() {
        let mut svc = ServiceDefinition {
            org: "o".to_string(),
            url: "u".to_string(),
            version: "1.0.0".to_string(),
            arch: "amd64".to_string(),
            required_services: vec![],
            user_inputs: vec![InputSchema {
                name: "apiKey".to_string(),
                input_type: InputType::String,
                default_value: "x".to_string(),
                label: String::new(),
            }],
        };
        assert!(!svc.needs_user_input());
        svc.user_inputs[0].default_value.clear();
        assert!(svc.needs_user_input());
    }

    #[test]
    fn env_rendering_joins_lists() {
        let b = binding(
            "o",
            "s",
            "",
            "",
            &[
                ("words", json!(["a", "b"])),
                ("n", json!(7)),
                ("flag", json!(true)),
            ],
        );
        let env = binding_to_env(&b);
        assert_eq!(env["words"], "a,b");
        assert_eq!(env["n"], "7");
        assert_eq!(env["flag"], "true");
    }
}
