//! LoomForm controller
//!
//! Validates a form's template entries - unique ids, resolvable
//! dependencies, acyclic graph, parseable templates and ignore paths -
//! and stamps the result onto the form's status.

use std::sync::Arc;

use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use loom_common::crd::{Condition, ConditionStatus, LoomForm, LoomFormStatus, CONDITION_READY};
use loom_common::{Error, EventPublisher};
use tracing::{info, warn};

use crate::fieldpath::FieldFilter;
use crate::graph;
use crate::template::Engine;

use super::BackoffTracker;

/// Shared state handed to every form reconcile
pub struct Context {
    /// Kube client for form status updates
    pub client: Client,
    /// Shared template engine for syntax validation
    pub engine: Arc<Engine>,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Transient-error backoff state
    pub backoff: BackoffTracker,
}

/// Validate every entry of a form.
///
/// Checks, in order: ids non-empty and unique, every dependIds target
/// exists, the induced graph is acyclic, every template string parses, and
/// every ignoreFields path compiles.
pub fn validate_form(engine: &Engine, form: &LoomForm) -> Result<(), Error> {
    let resources = form.spec.all_resources();
    let form_name = form.name_any();

    // Graph construction covers empty ids, duplicates, dangling
    // dependencies, and cycles
    graph::build_graph(&resources)
        .map_err(|e| Error::validation_for(form_name.clone(), e.to_string()))?;

    for resource in &resources {
        if let Some(ref template) = resource.name_template {
            engine.validate(template).map_err(|e| {
                Error::validation_for_field(
                    form_name.clone(),
                    format!("resource {} nameTemplate", resource.id),
                    e.to_string(),
                )
            })?;
        }
        if let Some(ref template) = resource.namespace_template {
            engine.validate(template).map_err(|e| {
                Error::validation_for_field(
                    form_name.clone(),
                    format!("resource {} namespaceTemplate", resource.id),
                    e.to_string(),
                )
            })?;
        }
        for (key, template) in resource
            .labels_template
            .iter()
            .chain(resource.annotations_template.iter())
        {
            engine.validate(template).map_err(|e| {
                Error::validation_for_field(
                    form_name.clone(),
                    format!("resource {} template for key {key:?}", resource.id),
                    e.to_string(),
                )
            })?;
        }
        FieldFilter::compile(&resource.ignore_fields).map_err(|e| {
            Error::validation_for_field(
                form_name.clone(),
                format!("resource {} ignoreFields", resource.id),
                e.to_string(),
            )
        })?;
    }

    Ok(())
}

/// Reconcile one form: validate and stamp status
pub async fn reconcile(form: Arc<LoomForm>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = form.name_any();
    let namespace = form.namespace().unwrap_or_default();

    let validation = validate_form(&ctx.engine, &form);
    let resource_count = form.spec.all_resources().len() as i32;

    let condition = match &validation {
        Ok(()) => Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Validated",
            format!("Form validated: {resource_count} resource entries"),
        ),
        Err(e) => {
            warn!(form = %name, error = %e, "form validation failed");
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "ValidationFailed",
                e.to_string(),
            )
        }
    };

    // Stamp observedGeneration and the validation outcome
    let api: Api<LoomForm> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(mut latest) = api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };

    let previous_generation = latest.status.as_ref().and_then(|s| s.observed_generation);
    let generation_moved = previous_generation != form.meta().generation;

    let status = latest.status.get_or_insert_with(LoomFormStatus::default);
    status.observed_generation = form.meta().generation;
    status.resource_count = resource_count;

    let changed = match status.conditions.iter_mut().find(|c| c.type_ == CONDITION_READY) {
        Some(existing) if existing.same_state(&condition) => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            status.conditions.push(condition);
            true
        }
    };

    if changed || generation_moved {
        let data = serde_json::to_vec(&latest)
            .map_err(|e| Error::serialization(format!("cannot serialize form status: {e}")))?;
        api.replace_status(&name, &PostParams::default(), data)
            .await?;
        info!(form = %name, valid = validation.is_ok(), "form status stamped");
    }

    ctx.backoff.reset(&name);
    Ok(Action::await_change())
}

/// Error policy for the form controller
pub fn error_policy(form: Arc<LoomForm>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = form.name_any();
    if err.is_retryable() {
        let delay = ctx.backoff.next_delay(&name);
        warn!(form = %name, error = %err, delay_secs = delay.as_secs(), "form reconcile failed, requeuing");
        Action::requeue(delay)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_common::crd::{LoomFormSpec, ResourceGroups, TResource};
    use serde_json::json;

    fn form_with(resources: ResourceGroups) -> LoomForm {
        LoomForm::new(
            "web-form",
            LoomFormSpec {
                hub_ref: "main-hub".to_string(),
                resources,
            },
        )
    }

    fn entry(id: &str, deps: &[&str]) -> TResource {
        TResource {
            id: id.to_string(),
            spec: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
            depend_ids: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_form_passes() {
        let form = form_with(ResourceGroups {
            config_maps: vec![entry("cm", &[])],
            deployments: vec![TResource {
                name_template: Some("{{ uid }}-app".to_string()),
                ignore_fields: vec!["$.spec.replicas".to_string()],
                ..entry("app", &["cm"])
            }],
            ..Default::default()
        });
        assert!(validate_form(&Engine::new(), &form).is_ok());
    }

    #[test]
    fn test_duplicate_ids_across_groups_rejected() {
        let form = form_with(ResourceGroups {
            config_maps: vec![entry("shared", &[])],
            secrets: vec![entry("shared", &[])],
            ..Default::default()
        });
        let err = validate_form(&Engine::new(), &form).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let form = form_with(ResourceGroups {
            deployments: vec![entry("app", &["ghost"])],
            ..Default::default()
        });
        let err = validate_form(&Engine::new(), &form).unwrap_err();
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn test_cycle_rejected() {
        let form = form_with(ResourceGroups {
            config_maps: vec![entry("a", &["b"]), entry("b", &["a"])],
            ..Default::default()
        });
        let err = validate_form(&Engine::new(), &form).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn test_bad_template_rejected() {
        let form = form_with(ResourceGroups {
            config_maps: vec![TResource {
                name_template: Some("{% if x %}unclosed".to_string()),
                ..entry("cm", &[])
            }],
            ..Default::default()
        });
        let err = validate_form(&Engine::new(), &form).unwrap_err();
        assert!(err.to_string().contains("nameTemplate"));
    }

    #[test]
    fn test_bad_label_template_names_the_key() {
        let form = form_with(ResourceGroups {
            config_maps: vec![TResource {
                labels_template: std::collections::BTreeMap::from([(
                    "bad".to_string(),
                    "{% endfor %}".to_string(),
                )]),
                ..entry("cm", &[])
            }],
            ..Default::default()
        });
        let err = validate_form(&Engine::new(), &form).unwrap_err();
        assert!(err.to_string().contains("\"bad\""));
    }

    #[test]
    fn test_bad_ignore_path_rejected() {
        let form = form_with(ResourceGroups {
            config_maps: vec![TResource {
                ignore_fields: vec!["spec.replicas".to_string()],
                ..entry("cm", &[])
            }],
            ..Default::default()
        });
        let err = validate_form(&Engine::new(), &form).unwrap_err();
        assert!(err.to_string().contains("ignoreFields"));
    }

    #[test]
    fn test_empty_form_is_valid() {
        let form = form_with(ResourceGroups::default());
        assert!(validate_form(&Engine::new(), &form).is_ok());
    }
}
