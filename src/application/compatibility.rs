// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// User-input compatibility checking.
//
// A pure decision procedure over (node, deployment directive, service
// catalog): resolve the directive to service references, resolve each
// reference's versions (and their dependency closures), merge the
// directive's and the node's user-input bindings directive-first, and
// check the merge against every service's declared variable schema.
// Nothing here touches the agreement store; front-ends call it
// synchronously.
//
// Message text flows through an explicit locale-bound printer so callers
// embedded in other locales can substitute their own; the process-wide
// default is only reached for at the outermost entry point.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::domain::deployment::{
    find_user_input, is_arch_wildcard, merge_user_input, service_id, service_id_without_arch,
    validate_service_file, BusinessPolicy, PatternFile, ResolvedService, ServiceDefinition,
    ServiceFile, ServiceModel, ServiceReference, UserInputBinding,
};
use crate::domain::version::VersionRange;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// What went wrong, and whose fault it was. The first three kinds are
/// user-caused and carry a printable message; `General` wraps unexpected
/// internal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Validation,
    Exchange,
    General,
}

#[derive(Debug, Error)]
pub enum CompatibilityError {
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Exchange(String),
    #[error("{0}")]
    General(String),
}

impl CompatibilityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Exchange(_) => ErrorKind::Exchange,
            Self::General(_) => ErrorKind::General,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CatalogError(pub String);

// ---------------------------------------------------------------------------
// Message printer
// ---------------------------------------------------------------------------

/// Locale-bound message formatting. Today only the base locale ships; the
/// printer is still threaded explicitly so embedders can swap it.
#[derive(Debug, Clone)]
pub struct MessagePrinter {
    pub locale: String,
}

static DEFAULT_PRINTER: OnceLock<MessagePrinter> = OnceLock::new();

impl MessagePrinter {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
        }
    }

    /// The process-wide printer, for outermost boundaries only.
    pub fn default_printer() -> &'static MessagePrinter {
        DEFAULT_PRINTER.get_or_init(|| MessagePrinter::new("en"))
    }

    pub fn compatible(&self) -> String {
        "Compatible".to_string()
    }

    pub fn incompatible_prefix(&self) -> String {
        "User Input Incompatible".to_string()
    }

    pub fn missing_variable(&self, name: &str) -> String {
        format!(
            "A required user input value is missing for variable {}.",
            name
        )
    }

    pub fn type_mismatch(&self, name: &str, expected: &str) -> String {
        format!(
            "Failed to validate the user input type for variable {}: expected {}.",
            name, expected
        )
    }

    pub fn no_user_input(&self) -> String {
        "No user input found for service.".to_string()
    }

    pub fn not_found_in_input(&self) -> String {
        "Service definition not found in the input.".to_string()
    }

    pub fn verify_failed(&self, service_id: &str, reason: &str) -> String {
        format!(
            "Failed to verify user input for service {}. {}",
            service_id, reason
        )
    }

    pub fn dependent_verify_failed(&self, service_id: &str, reason: &str) -> String {
        format!(
            "Failed to verify user input for dependent service {}. {}",
            service_id, reason
        )
    }
}

// ---------------------------------------------------------------------------
// Catalog collaborator
// ---------------------------------------------------------------------------

/// A node as the catalog knows it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRecord {
    pub arch: String,
    pub user_input: Vec<UserInputBinding>,
}

/// The catalog callbacks the evaluator resolves through. All lookups are
/// read-only; any failure aborts the evaluation.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn fetch_node(&self, id: &str) -> Result<Option<NodeRecord>, CatalogError>;

    async fn fetch_business_policy(
        &self,
        id: &str,
    ) -> Result<Option<BusinessPolicy>, CatalogError>;

    async fn fetch_pattern(&self, id: &str) -> Result<Option<PatternFile>, CatalogError>;

    /// One service, highest version within the range. Returns the
    /// definition and its id.
    async fn fetch_service(
        &self,
        org: &str,
        url: &str,
        version_range: &str,
        arch: &str,
    ) -> Result<Option<(ServiceDefinition, String)>, CatalogError>;

    /// One service plus its transitive dependency closure, keyed by
    /// service id.
    async fn resolve_service_with_deps(
        &self,
        org: &str,
        url: &str,
        version_range: &str,
        arch: &str,
    ) -> Result<Option<(HashMap<String, ServiceDefinition>, ServiceDefinition, String)>, CatalogError>;

    /// Every arch variant of `(org, url, version)`, keyed by service id.
    async fn list_services_all_arches(
        &self,
        org: &str,
        url: &str,
        version: &str,
    ) -> Result<HashMap<String, ServiceDefinition>, CatalogError>;
}

// ---------------------------------------------------------------------------
// Check input and report
// ---------------------------------------------------------------------------

/// The check request. Exactly one of node id / node user input, and
/// exactly one of business policy / pattern (by id or inline).
#[derive(Debug, Clone, Default)]
pub struct CompatibilityCheck {
    pub node_id: Option<String>,
    pub node_arch: Option<String>,
    pub node_user_input: Option<Vec<UserInputBinding>>,
    pub business_policy_id: Option<String>,
    pub business_policy: Option<BusinessPolicy>,
    pub pattern_id: Option<String>,
    pub pattern: Option<PatternFile>,
    /// Inline service definitions used instead of catalog fetches.
    pub services: Vec<ServiceFile>,
    /// When non-empty, only these service ids are evaluated. Ids ending in
    /// `_*` or `_` apply to every arch.
    pub services_to_check: Vec<String>,
}

/// Everything the evaluation resolved, echoed back for the caller.
#[derive(Debug, Clone, Default)]
pub struct CheckedResources {
    pub node_arch: String,
    pub node_user_input: Vec<UserInputBinding>,
    pub directive_user_input: Vec<UserInputBinding>,
    pub business_policy: Option<BusinessPolicy>,
    pub pattern: Option<PatternFile>,
    pub services: Vec<ResolvedService>,
}

#[derive(Debug, Clone)]
pub struct CompatibilityReport {
    pub compatible: bool,
    /// Per-service verdicts, keyed by service id.
    pub messages: HashMap<String, String>,
    pub resources: CheckedResources,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn exchange_err(e: CatalogError) -> CompatibilityError {
    CompatibilityError::Exchange(e.0)
}

/// True when `id` is among the ids the caller asked to evaluate.
fn need_handle_service(id: &str, to_check: &[String]) -> bool {
    if to_check.is_empty() {
        return true;
    }
    to_check.iter().any(|candidate| {
        if candidate.ends_with("_*") || candidate.ends_with('_') {
            service_id_without_arch(candidate) == service_id_without_arch(id)
        } else {
            candidate == id
        }
    })
}

/// Check whether the merged user input satisfies every service a directive
/// would deploy on the node. Pure over its inputs: same node, directive,
/// and catalog always produce the same report.
pub async fn user_input_compatible(
    catalog: &dyn ServiceCatalog,
    check: &CompatibilityCheck,
    check_all: bool,
    printer: Option<&MessagePrinter>,
) -> Result<CompatibilityReport, CompatibilityError> {
    let printer = printer.unwrap_or_else(|| MessagePrinter::default_printer());
    let mut resources = CheckedResources::default();

    // Step 1: node user input and arch.
    let node_user_input: Vec<UserInputBinding>;
    if let Some(user_input) = &check.node_user_input {
        node_user_input = user_input.clone();
        resources.node_arch = check.node_arch.clone().unwrap_or_default();
    } else if let Some(node_id) = &check.node_id {
        let node = catalog
            .fetch_node(node_id)
            .await
            .map_err(exchange_err)?
            .ok_or_else(|| {
                CompatibilityError::Input(format!("Node {} cannot be found.", node_id))
            })?;
        match &check.node_arch {
            Some(supplied) if !supplied.is_empty() => {
                if !node.arch.is_empty() && node.arch != *supplied {
                    return Err(CompatibilityError::Input(format!(
                        "The input node architecture {} does not match the architecture {} of node {}.",
                        supplied, node.arch, node_id
                    )));
                }
                resources.node_arch = supplied.clone();
            }
            _ => resources.node_arch = node.arch.clone(),
        }
        node_user_input = node.user_input;
    } else {
        return Err(CompatibilityError::Input(
            "Neither node user input nor node id is specified.".to_string(),
        ));
    }
    resources.node_user_input = node_user_input.clone();

    // Step 2: exactly one directive, resolved.
    let use_policy = check.business_policy_id.is_some() || check.business_policy.is_some();
    let use_pattern = check.pattern_id.is_some() || check.pattern.is_some();
    if use_policy && use_pattern {
        return Err(CompatibilityError::Input(
            "Business policy and pattern are mutually exclusive.".to_string(),
        ));
    }
    if !use_policy && !use_pattern {
        return Err(CompatibilityError::Input(
            "Neither business policy nor pattern is specified.".to_string(),
        ));
    }

    let directive_user_input: Vec<UserInputBinding>;
    let references: Vec<ServiceReference>;
    if use_policy {
        let policy = match &check.business_policy {
            Some(policy) => policy.clone(),
            None => {
                let id = check.business_policy_id.as_ref().expect("id checked above");
                catalog
                    .fetch_business_policy(id)
                    .await
                    .map_err(exchange_err)?
                    .ok_or_else(|| {
                        CompatibilityError::Input(format!(
                            "Business policy {} cannot be found.",
                            id
                        ))
                    })?
            }
        };
        directive_user_input = policy.user_input.clone();
        references = policy.service_references(&resources.node_arch);
        resources.business_policy = Some(policy);
    } else {
        let pattern = match &check.pattern {
            Some(pattern) => pattern.clone(),
            None => {
                let id = check.pattern_id.as_ref().expect("id checked above");
                catalog
                    .fetch_pattern(id)
                    .await
                    .map_err(exchange_err)?
                    .ok_or_else(|| {
                        CompatibilityError::Input(format!("Pattern {} cannot be found.", id))
                    })?
            }
        };
        directive_user_input = pattern.user_input.clone();
        references = pattern.service_references(&resources.node_arch);
        resources.pattern = Some(pattern);
    }
    resources.directive_user_input = directive_user_input.clone();

    if references.is_empty() {
        return Err(if resources.node_arch.is_empty() {
            CompatibilityError::Validation(
                "No service versions specified in the business policy or pattern.".to_string(),
            )
        } else {
            CompatibilityError::Validation(format!(
                "No service versions with architecture {} specified in the business policy or pattern.",
                resources.node_arch
            ))
        });
    }

    // Step 3: inline services must be structurally valid and belong to the
    // directive.
    validate_inline_services(check, &references)?;

    let mut messages: HashMap<String, String> = HashMap::new();
    let mut compatible_services: Vec<ResolvedService> = Vec::new();
    let mut incompatible_services: Vec<ResolvedService> = Vec::new();
    let mut overall_compatible = true;

    // Step 4: every reference needs at least one compatible version.
    for reference in &references {
        let mut reference_compatible = false;

        'versions: for choice in &reference.service_versions {
            let version = &choice.version;

            if check.services.is_empty() {
                if !is_arch_wildcard(&reference.service_arch) {
                    let id = service_id(
                        &reference.service_org,
                        &reference.service_url,
                        version,
                        &reference.service_arch,
                    );
                    if !need_handle_service(&id, &check.services_to_check) {
                        continue;
                    }
                    let Some((deps, definition, _)) = catalog
                        .resolve_service_with_deps(
                            &reference.service_org,
                            &reference.service_url,
                            version,
                            &reference.service_arch,
                        )
                        .await
                        .map_err(exchange_err)?
                    else {
                        return Err(CompatibilityError::Exchange(format!(
                            "Service {}/{} version {} cannot be found in the catalog.",
                            reference.service_org, reference.service_url, version
                        )));
                    };
                    let verdict = verify_resolved(
                        &definition,
                        &deps,
                        &directive_user_input,
                        &node_user_input,
                        printer,
                    )?;
                    let resolved = ResolvedService::Fetched(definition);
                    match verdict {
                        None => {
                            reference_compatible = true;
                            compatible_services.push(resolved);
                            messages.insert(id, printer.compatible());
                            if !check_all {
                                break 'versions;
                            }
                        }
                        Some(reason) => {
                            incompatible_services.push(resolved);
                            messages.insert(
                                id,
                                format!("{}: {}", printer.incompatible_prefix(), reason),
                            );
                        }
                    }
                } else {
                    // Wildcard arch: every arch variant of this version is
                    // a candidate.
                    let variants = catalog
                        .list_services_all_arches(
                            &reference.service_org,
                            &reference.service_url,
                            version,
                        )
                        .await
                        .map_err(|e| {
                            CompatibilityError::Exchange(format!(
                                "Error getting services of all architectures for {}/{} version {}. {}",
                                reference.service_org, reference.service_url, version, e
                            ))
                        })?;
                    for (id, definition) in variants {
                        if !need_handle_service(&id, &check.services_to_check) {
                            continue;
                        }
                        let verdict = verify_with_resolved_deps(
                            catalog,
                            &definition,
                            &directive_user_input,
                            &node_user_input,
                            printer,
                        )
                        .await?;
                        let resolved = ResolvedService::Fetched(definition);
                        match verdict {
                            None => {
                                reference_compatible = true;
                                compatible_services.push(resolved);
                                messages.insert(id, printer.compatible());
                                if !check_all {
                                    break;
                                }
                            }
                            Some(reason) => {
                                incompatible_services.push(resolved);
                                messages.insert(
                                    id,
                                    format!("{}: {}", printer.incompatible_prefix(), reason),
                                );
                            }
                        }
                    }
                    if reference_compatible && !check_all {
                        break 'versions;
                    }
                }
            } else {
                // Inline services supplied: use those instead of fetching.
                let found = check.services.iter().find(|svc| {
                    svc.url == reference.service_url
                        && svc.version == *version
                        && (is_arch_wildcard(&reference.service_arch)
                            || svc.arch == reference.service_arch)
                        && (svc.org.is_empty() || svc.org == reference.service_org)
                });
                let id = service_id(
                    &reference.service_org,
                    &reference.service_url,
                    version,
                    &reference.service_arch,
                );
                if !need_handle_service(&id, &check.services_to_check) {
                    continue;
                }
                match found {
                    None => {
                        messages.insert(
                            id,
                            format!(
                                "{}: {}",
                                printer.incompatible_prefix(),
                                printer.not_found_in_input()
                            ),
                        );
                    }
                    Some(service) => {
                        let mut service = service.clone();
                        if service.org.is_empty() {
                            service.org = reference.service_org.clone();
                        }
                        let verdict = verify_with_resolved_deps(
                            catalog,
                            &service,
                            &directive_user_input,
                            &node_user_input,
                            printer,
                        )
                        .await?;
                        let resolved = ResolvedService::Inline(service);
                        match verdict {
                            None => {
                                reference_compatible = true;
                                compatible_services.push(resolved);
                                messages.insert(id, printer.compatible());
                                if !check_all {
                                    break 'versions;
                                }
                            }
                            Some(reason) => {
                                incompatible_services.push(resolved);
                                messages.insert(
                                    id,
                                    format!("{}: {}", printer.incompatible_prefix(), reason),
                                );
                            }
                        }
                    }
                }
            }
        }

        if !reference_compatible {
            overall_compatible = false;
        }
    }

    // Step 5: compatible iff every reference had a compatible version.
    if messages.is_empty() {
        let reason = if resources.node_arch.is_empty() {
            "No services found in the business policy or pattern.".to_string()
        } else {
            format!(
                "Service with architecture {} cannot be found in the business policy or pattern.",
                resources.node_arch
            )
        };
        messages.insert(
            "general".to_string(),
            format!("{}: {}", printer.incompatible_prefix(), reason),
        );
        return Ok(CompatibilityReport {
            compatible: false,
            messages,
            resources,
        });
    }

    resources.services = if overall_compatible {
        compatible_services
    } else {
        incompatible_services
    };
    Ok(CompatibilityReport {
        compatible: overall_compatible,
        messages,
        resources,
    })
}

/// Check one service by coordinates, without its dependencies. The helper
/// front-ends use for spot checks.
pub async fn verify_single_service(
    catalog: &dyn ServiceCatalog,
    org: &str,
    url: &str,
    version_range: &str,
    arch: &str,
    directive_user_input: &[UserInputBinding],
    node_user_input: &[UserInputBinding],
    printer: Option<&MessagePrinter>,
) -> Result<Option<String>, CompatibilityError> {
    let printer = printer.unwrap_or_else(|| MessagePrinter::default_printer());
    let Some((definition, _)) = catalog
        .fetch_service(org, url, version_range, arch)
        .await
        .map_err(exchange_err)?
    else {
        return Err(CompatibilityError::Exchange(format!(
            "Service {}/{} cannot be found in the catalog.",
            org, url
        )));
    };
    verify_one(&definition, directive_user_input, node_user_input, printer)
}

/// Verify a service whose dependency closure is already resolved. `None`
/// means compatible; `Some(reason)` names the first failure.
fn verify_resolved(
    definition: &ServiceDefinition,
    dependencies: &HashMap<String, ServiceDefinition>,
    directive_user_input: &[UserInputBinding],
    node_user_input: &[UserInputBinding],
    printer: &MessagePrinter,
) -> Result<Option<String>, CompatibilityError> {
    let id = model_id(definition);
    if let Some(reason) =
        verify_one(definition, directive_user_input, node_user_input, printer)?
    {
        return Ok(Some(printer.verify_failed(&id, &reason)));
    }
    for (dep_id, dependency) in dependencies {
        if let Some(reason) =
            verify_one(dependency, directive_user_input, node_user_input, printer)?
        {
            return Ok(Some(printer.dependent_verify_failed(dep_id, &reason)));
        }
    }
    Ok(None)
}

/// Verify a service, resolving its dependency closure from the catalog
/// first.
async fn verify_with_resolved_deps(
    catalog: &dyn ServiceCatalog,
    service: &dyn ServiceModel,
    directive_user_input: &[UserInputBinding],
    node_user_input: &[UserInputBinding],
    printer: &MessagePrinter,
) -> Result<Option<String>, CompatibilityError> {
    let id = model_id(service);
    if let Some(reason) = verify_one(service, directive_user_input, node_user_input, printer)? {
        return Ok(Some(printer.verify_failed(&id, &reason)));
    }

    let mut dependencies: HashMap<String, ServiceDefinition> = HashMap::new();
    for dep in service.required_services() {
        let range = VersionRange::parse(&dep.version).map_err(|e| {
            CompatibilityError::General(format!(
                "Unable to create version expression from {}. {}",
                dep.version, e
            ))
        })?;
        let Some((dep_map, dep_def, dep_id)) = catalog
            .resolve_service_with_deps(&dep.org, &dep.url, &range.to_string(), &dep.arch)
            .await
            .map_err(exchange_err)?
        else {
            return Err(CompatibilityError::Exchange(format!(
                "Error retrieving dependent service {}/{} from the catalog.",
                dep.org, dep.url
            )));
        };
        dependencies.insert(dep_id, dep_def);
        dependencies.extend(dep_map);
    }

    for (dep_id, dependency) in &dependencies {
        if let Some(reason) =
            verify_one(dependency, directive_user_input, node_user_input, printer)?
        {
            return Ok(Some(printer.dependent_verify_failed(dep_id, &reason)));
        }
    }
    Ok(None)
}

fn model_id(service: &dyn ServiceModel) -> String {
    service_id(
        service.org(),
        service.url(),
        service.version(),
        service.arch(),
    )
}

/// The core check for a single service: find both bindings, merge
/// directive-first, then demand that every declared variable is either
/// well-typed in the merge or defaulted in the schema.
fn verify_one(
    service: &dyn ServiceModel,
    directive_user_input: &[UserInputBinding],
    node_user_input: &[UserInputBinding],
    printer: &MessagePrinter,
) -> Result<Option<String>, CompatibilityError> {
    if !service.needs_user_input() && service.user_inputs().is_empty() {
        return Ok(None);
    }

    let general = |e: crate::domain::version::VersionError| {
        CompatibilityError::General(e.to_string())
    };
    let directive_binding = find_user_input(
        service.url(),
        service.org(),
        service.version(),
        service.arch(),
        directive_user_input,
    )
    .map_err(general)?;
    let node_binding = find_user_input(
        service.url(),
        service.org(),
        service.version(),
        service.arch(),
        node_user_input,
    )
    .map_err(general)?;

    let merged = match (directive_binding, node_binding) {
        (None, None) => {
            if service.needs_user_input() {
                return Ok(Some(printer.no_user_input()));
            }
            return Ok(None);
        }
        (Some(directive), Some(node)) => merge_user_input(directive, node),
        (Some(directive), None) => directive.clone(),
        (None, Some(node)) => node.clone(),
    };

    for declared in service.user_inputs() {
        match merged.get(&declared.name) {
            Some(value) => {
                if !declared.input_type.accepts(value) {
                    return Ok(Some(printer.type_mismatch(
                        &declared.name,
                        declared.input_type.as_str(),
                    )));
                }
            }
            None => {
                if declared.default_value.is_empty() {
                    return Ok(Some(printer.missing_variable(&declared.name)));
                }
            }
        }
    }
    Ok(None)
}

/// Inline services must be well-formed and actually named by the
/// directive.
fn validate_inline_services(
    check: &CompatibilityCheck,
    references: &[ServiceReference],
) -> Result<(), CompatibilityError> {
    for service in &check.services {
        validate_service_file(service).map_err(CompatibilityError::Validation)?;

        let id = service_id(&service.org, &service.url, &service.version, &service.arch);
        if !need_handle_service(&id, &check.services_to_check) {
            continue;
        }
        let named = references.iter().any(|reference| {
            reference.service_url == service.url
                && (service.org.is_empty() || reference.service_org == service.org)
                && (is_arch_wildcard(&reference.service_arch)
                    || reference.service_arch == service.arch)
                && reference
                    .service_versions
                    .iter()
                    .any(|v| v.version == service.version)
        });
        if !named {
            return Err(CompatibilityError::Validation(format!(
                "Validation failure for input service {}: the service does not match any services in the business policy or pattern.",
                id
            )));
        }
    }
    Ok(())
}
