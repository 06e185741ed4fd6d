//! Turning feature content into manifest documents.
//!
//! Content comes from ConfigMap/Secret data entries, optionally flagged as
//! templates, or from a script. Template expansion and script evaluation are
//! delegated to [`TemplateRenderer`] and [`ScriptEvaluator`]; this module only
//! assembles their input and splits their output into documents.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use handlebars::Handlebars;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::cluster::{bounded, ClusterClient};
use crate::config::ScriptConfig;
use crate::deployer::ClusterRef;
use crate::error::RenderError;
use crate::resource::{split_documents, OwnershipLabels, ResourceIdentity, ResourceKind};

/// Annotation marking a ConfigMap/Secret whose entries are templates. Any
/// value other than `false` counts.
pub const TEMPLATE_ANNOTATION: &str = "addons.cto.dev/template";

/// Context objects handed to templates and scripts, keyed by identifier.
pub type RenderContext = BTreeMap<String, Value>;

/// Text-template collaborator.
#[cfg_attr(test, automock)]
pub trait TemplateRenderer: Send + Sync {
    /// Render `template`; `name` identifies it in errors.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Template`] when the template is invalid or fails.
    fn render(&self, name: &str, template: &str, context: &RenderContext) -> Result<String, RenderError>;
}

/// Embedded-script collaborator.
#[cfg_attr(test, automock)]
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `script` and return the manifests it produced.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Script`] when evaluation fails.
    fn evaluate(&self, script: &str, context: &RenderContext) -> Result<String, RenderError>;
}

/// Handlebars-backed [`TemplateRenderer`]. Missing values render as empty
/// strings and output is never HTML-escaped.
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self::with_strict_mode(false)
    }
}

impl HandlebarsRenderer {
    /// A renderer that fails on any variable missing from the context.
    #[must_use]
    pub fn strict() -> Self {
        Self::with_strict_mode(true)
    }

    fn with_strict_mode(strict: bool) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(strict);
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }
}

impl TemplateRenderer for HandlebarsRenderer {
    fn render(&self, name: &str, template: &str, context: &RenderContext) -> Result<String, RenderError> {
        self.registry
            .render_template(template, context)
            .map_err(|e| RenderError::Template {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

/// A ConfigMap or Secret holding manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    /// Entries are templates to expand before deployment.
    #[serde(default)]
    pub is_template: bool,
    /// Entry name to raw text, iterated in name order.
    pub data: BTreeMap<String, String>,
}

impl ContentSource {
    #[must_use]
    pub fn from_config_map(config_map: &ConfigMap) -> Self {
        let meta = &config_map.metadata;
        Self {
            kind: "ConfigMap".to_string(),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            is_template: is_template(meta.annotations.as_ref()),
            data: config_map.data.clone().unwrap_or_default(),
        }
    }

    /// # Errors
    ///
    /// Returns [`RenderError::InvalidSource`] when an entry is not UTF-8.
    pub fn from_secret(secret: &Secret) -> Result<Self, RenderError> {
        let meta = &secret.metadata;
        let name = meta.name.clone().unwrap_or_default();
        let mut data = secret.string_data.clone().unwrap_or_default();
        for (key, bytes) in secret.data.iter().flatten() {
            let text = String::from_utf8(bytes.0.clone()).map_err(|_| {
                RenderError::InvalidSource(format!("Secret {name}: entry {key} is not UTF-8"))
            })?;
            data.insert(key.clone(), text);
        }
        Ok(Self {
            kind: "Secret".to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            is_template: is_template(meta.annotations.as_ref()),
            name,
            data,
        })
    }

    /// Ownership triple stamped on everything deployed from this source.
    #[must_use]
    pub fn owner(&self) -> OwnershipLabels {
        OwnershipLabels::new(&self.kind, &self.name, &self.namespace)
    }

    /// All entries joined in name order, as a single bundle.
    #[must_use]
    pub fn bundle(&self) -> String {
        self.data
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

fn is_template(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations
        .and_then(|a| a.get(TEMPLATE_ANNOTATION))
        .is_some_and(|v| !v.eq_ignore_ascii_case("false"))
}

/// An object fetched from the management cluster and exposed to templates
/// under `identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResourceRef {
    pub identifier: String,
    pub kind: ResourceKind,
    /// May reference `{{ClusterNamespace}}` and `{{ClusterName}}`.
    pub name: String,
    /// Defaults to the cluster's namespace.
    #[serde(default)]
    pub namespace: String,
}

/// Fetch every referenced object into a context map.
///
/// Objects that do not exist are left out.
///
/// # Errors
///
/// Returns [`RenderError::Reference`] when a lookup fails for any other
/// reason, or a template error when a name cannot be instantiated or
/// instantiates to nothing.
#[instrument(skip_all, fields(cluster = %cluster_ref.name, refs = refs.len()))]
pub async fn collect_template_resources(
    management: &dyn ClusterClient,
    refs: &[TemplateResourceRef],
    cluster_ref: &ClusterRef,
    renderer: &dyn TemplateRenderer,
    api_timeout: Duration,
) -> Result<RenderContext, RenderError> {
    let name_context = RenderContext::from([
        ("ClusterNamespace".to_string(), json!(cluster_ref.namespace)),
        ("ClusterName".to_string(), json!(cluster_ref.name)),
    ]);

    let mut context = RenderContext::new();
    for reference in refs {
        let namespace = if reference.namespace.is_empty() {
            cluster_ref.namespace.as_str()
        } else {
            reference.namespace.as_str()
        };
        let name = renderer.render(&reference.identifier, &reference.name, &name_context)?;
        if name.trim().is_empty() {
            return Err(RenderError::Template {
                name: reference.identifier.clone(),
                message: format!("name template {:?} rendered to an empty name", reference.name),
            });
        }
        let id = ResourceIdentity::new(&reference.kind, namespace, name);

        let object = bounded(api_timeout, management.get(&id))
            .await
            .map_err(|source| RenderError::Reference {
                identifier: reference.identifier.clone(),
                source,
            })?;
        let Some(object) = object else {
            debug!(identifier = %reference.identifier, resource = %id, "Referenced resource not found, skipping");
            continue;
        };
        let value = serde_json::to_value(&object).map_err(|e| RenderError::Reference {
            identifier: reference.identifier.clone(),
            source: e.into(),
        })?;
        context.insert(reference.identifier.clone(), value);
    }
    Ok(context)
}

/// Produces the ordered documents of a deployment request.
#[derive(Default, Clone)]
pub struct ManifestRenderer {
    templates: Option<Arc<dyn TemplateRenderer>>,
    scripts: Option<Arc<dyn ScriptEvaluator>>,
    script_config: ScriptConfig,
}

impl ManifestRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_templates(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.templates = Some(renderer);
        self
    }

    /// The scripting configuration snapshot in use.
    #[must_use]
    pub fn script_config(&self) -> &ScriptConfig {
        &self.script_config
    }

    #[must_use]
    pub fn with_scripts(mut self, evaluator: Arc<dyn ScriptEvaluator>, config: ScriptConfig) -> Self {
        self.scripts = Some(evaluator);
        self.script_config = config;
        self
    }

    /// Documents of every entry, in entry name order. Template sources are
    /// expanded with `context` first.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NoRenderer`] for a template source without a
    /// renderer, or the renderer's own error.
    pub fn render_source(&self, source: &ContentSource, context: &RenderContext) -> Result<Vec<String>, RenderError> {
        let mut documents = Vec::new();
        for (key, text) in &source.data {
            let text = if source.is_template {
                let renderer = self
                    .templates
                    .as_ref()
                    .ok_or_else(|| RenderError::NoRenderer(format!("{} {}/{}", source.kind, source.namespace, source.name)))?;
                let name = format!("{}/{}/{}/{key}", source.kind, source.namespace, source.name);
                renderer.render(&name, text, context)?
            } else {
                text.clone()
            };
            documents.extend(split_documents(&text));
        }
        Ok(documents)
    }

    /// Evaluate `body` after the configured snippets. An empty body yields no
    /// documents.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NoEvaluator`] when no evaluator is configured, or
    /// the evaluator's own error.
    pub fn render_script(&self, body: &str, context: &RenderContext) -> Result<Vec<String>, RenderError> {
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let evaluator = self.scripts.as_ref().ok_or(RenderError::NoEvaluator)?;
        let output = evaluator.evaluate(&self.script_config.assemble(body), context)?;
        Ok(split_documents(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use mockall::predicate::eq;

    use crate::cluster::{InMemoryCluster, Operation};
    use crate::resource::parse_document;

    fn config_map(data: &[(&str, &str)], template: bool) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("policies".to_string()),
                namespace: Some("default".to_string()),
                annotations: template
                    .then(|| BTreeMap::from([(TEMPLATE_ANNOTATION.to_string(), "true".to_string())])),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn plain_sources_pass_through_in_entry_order() {
        let source = ContentSource::from_config_map(&config_map(
            &[
                ("b-roles", "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n"),
                ("a-ns", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: one\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: two\n"),
            ],
            false,
        ));
        assert_eq!(source.owner(), OwnershipLabels::new("ConfigMap", "policies", "default"));

        let documents = ManifestRenderer::new()
            .render_source(&source, &RenderContext::new())
            .unwrap();
        assert_eq!(documents.len(), 3);
        assert!(documents[0].contains("name: one"));
        assert!(documents[2].contains("kind: ServiceAccount"));
    }

    #[test]
    fn template_sources_need_a_renderer() {
        let source = ContentSource::from_config_map(&config_map(&[("a", "x: {{y}}")], true));
        assert!(source.is_template);
        assert!(matches!(
            ManifestRenderer::new().render_source(&source, &RenderContext::new()),
            Err(RenderError::NoRenderer(_))
        ));
    }

    #[test]
    fn handlebars_renders_context_without_escaping() {
        let source = ContentSource::from_config_map(&config_map(
            &[(
                "cm",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{Cluster.metadata.name}}-cfg\ndata:\n  url: \"{{url}}\"\n  missing: \"{{nothing}}\"\n",
            )],
            true,
        ));
        let renderer = ManifestRenderer::new().with_templates(Arc::new(HandlebarsRenderer::default()));
        let context = RenderContext::from([
            ("Cluster".to_string(), json!({"metadata": {"name": "prod"}})),
            ("url".to_string(), json!("https://a.example/?x=1&y=2")),
        ]);

        let documents = renderer.render_source(&source, &context).unwrap();
        let object = parse_document(&documents[0]).unwrap().remove(0);
        assert_eq!(object.metadata.name.as_deref(), Some("prod-cfg"));
        assert_eq!(object.data["data"]["url"], "https://a.example/?x=1&y=2");
        assert_eq!(object.data["data"]["missing"], "");
    }

    #[test]
    fn secrets_decode_entries() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("bundle".to_string()),
                namespace: Some("ops".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "cm".to_string(),
                ByteString(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n".to_vec()),
            )])),
            ..Default::default()
        };
        let source = ContentSource::from_secret(&secret).unwrap();
        assert_eq!(source.kind, "Secret");
        assert!(source.data["cm"].contains("ConfigMap"));

        let invalid = Secret {
            data: Some(BTreeMap::from([("bad".to_string(), ByteString(vec![0xff, 0xfe]))])),
            ..secret
        };
        assert!(matches!(
            ContentSource::from_secret(&invalid),
            Err(RenderError::InvalidSource(_))
        ));
    }

    #[test]
    fn scripts_get_snippets_prepended() {
        let mut evaluator = MockScriptEvaluator::new();
        evaluator
            .expect_evaluate()
            .with(eq("function helper() end\nreturn helper()"), eq(RenderContext::new()))
            .times(1)
            .returning(|_, _| Ok("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: lua\n".to_string()));

        let config = ScriptConfig::from_data(BTreeMap::from([(
            "helpers".to_string(),
            "function helper() end".to_string(),
        )]));
        let renderer = ManifestRenderer::new().with_scripts(Arc::new(evaluator), config);
        let documents = renderer.render_script("return helper()", &RenderContext::new()).unwrap();
        assert_eq!(documents.len(), 1);
    }

    #[test]
    fn empty_script_skips_evaluation() {
        let mut evaluator = MockScriptEvaluator::new();
        evaluator.expect_evaluate().never();
        let renderer = ManifestRenderer::new().with_scripts(Arc::new(evaluator), ScriptConfig::default());
        assert!(renderer.render_script("  \n", &RenderContext::new()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn template_references_resolve_names_and_skip_missing_objects() {
        let management = InMemoryCluster::new();
        management
            .seed(
                parse_document(
                    "apiVersion: v1\nkind: Secret\nmetadata:\n  name: prod-credentials\n  namespace: fleet\ndata:\n  token: dG9r\n",
                )
                .unwrap()
                .remove(0),
            )
            .unwrap();

        let secret = ResourceKind::new("", "v1", "Secret");
        let refs = vec![
            TemplateResourceRef {
                identifier: "Credentials".to_string(),
                kind: secret.clone(),
                name: "{{ClusterName}}-credentials".to_string(),
                namespace: String::new(),
            },
            TemplateResourceRef {
                identifier: "Missing".to_string(),
                kind: secret,
                name: "absent".to_string(),
                namespace: "fleet".to_string(),
            },
        ];
        let cluster = ClusterRef {
            namespace: "fleet".to_string(),
            name: "prod".to_string(),
        };

        let context = collect_template_resources(
            &management,
            &refs,
            &cluster,
            &HandlebarsRenderer::strict(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(context.len(), 1);
        assert_eq!(context["Credentials"]["data"]["token"], "dG9r");
    }

    fn cluster_name_ref(name: &str) -> Vec<TemplateResourceRef> {
        vec![TemplateResourceRef {
            identifier: "Credentials".to_string(),
            kind: ResourceKind::new("", "v1", "Secret"),
            name: name.to_string(),
            namespace: String::new(),
        }]
    }

    #[tokio::test]
    async fn misspelled_name_variables_fail_rendering() {
        let management = InMemoryCluster::new();
        let cluster = ClusterRef {
            namespace: "fleet".to_string(),
            name: "prod".to_string(),
        };

        for renderer in [HandlebarsRenderer::strict(), HandlebarsRenderer::default()] {
            let err = collect_template_resources(
                &management,
                &cluster_name_ref("{{ClusterNam}}"),
                &cluster,
                &renderer,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, RenderError::Template { ref name, .. } if name == "Credentials"));
        }
        assert_eq!(management.calls(Operation::Get), 0);
    }

    #[test]
    fn strict_renderer_rejects_missing_variables() {
        let context = RenderContext::from([("ClusterName".to_string(), json!("prod"))]);
        let strict = HandlebarsRenderer::strict();
        assert_eq!(strict.render("n", "{{ClusterName}}-x", &context).unwrap(), "prod-x");
        assert!(strict.render("n", "{{ClusterNam}}-x", &context).is_err());
        assert_eq!(HandlebarsRenderer::default().render("n", "{{ClusterNam}}-x", &context).unwrap(), "-x");
    }
}
