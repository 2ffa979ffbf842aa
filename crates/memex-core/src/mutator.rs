//! Derivative mutators: rewrite or augment a derived [`Derivative`] before
//! it is embedded and persisted.
//!
//! Grounded on `derivative_mutator/derivative_mutator.py` (abstract base),
//! `identity_derivative_mutator.py`, `metadata_derivative_mutator.py`, and
//! `language_model_derivative_mutator.py`, including the latter's default
//! third-person rewrite system prompt.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::language_model::{LanguageModel, LanguageModelError, ToolChoice};
use crate::types::{ContentType, Derivative, EpisodeCluster, FilterablePropertyValue};

/// Error surface for [`DerivativeMutator`] implementations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    #[error(transparent)]
    LanguageModel(#[from] LanguageModelError),
}

/// Rewrites or augments a derivative, optionally against the context of the
/// cluster it was derived from. Mirrors the original's `DerivativeMutator`
/// abstract base. Can return more than one derivative per input (the
/// original documents this as a deliberate multiplication point: the final
/// mutated set is the flat concatenation of every mutator's outputs).
#[async_trait]
pub trait DerivativeMutator: Send + Sync {
    async fn mutate(
        &self,
        derivative: &Derivative,
        source_cluster: &EpisodeCluster,
    ) -> Result<Vec<Derivative>, MutatorError>;
}

/// Returns a fresh copy of the derivative, unchanged. Matches
/// `IdentityDerivativeMutator`.
pub struct IdentityMutator;

#[async_trait]
impl DerivativeMutator for IdentityMutator {
    async fn mutate(
        &self,
        derivative: &Derivative,
        _source_cluster: &EpisodeCluster,
    ) -> Result<Vec<Derivative>, MutatorError> {
        Ok(vec![Derivative { uuid: Uuid::new_v4(), ..derivative.clone() }])
    }
}

/// Renders a `$`-template against the derivative's own fields plus its
/// filterable properties and user metadata, so identity/routing context is
/// embedded directly in the searchable text. Matches
/// `MetadataDerivativeMutator`.
pub struct MetadataMutator {
    template: String,
}

impl MetadataMutator {
    /// `template` supports `$timestamp`, `$content`, `$derivative_type`,
    /// `$content_type`, plus any filterable-property or user-metadata key.
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }
}

impl Default for MetadataMutator {
    fn default() -> Self {
        Self::new("[$timestamp] $content")
    }
}

/// Render a `$key`-style template against a derivative's built-in fields,
/// overridable by filterable properties and user metadata (matching the
/// original's field-then-overlay merge order via dict unpacking).
fn render_metadata_template(template: &str, derivative: &Derivative) -> String {
    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("derivative_type", derivative.derivative_type.clone());
    values.insert("content_type", format!("{:?}", derivative.content_type).to_lowercase());
    values.insert("content", derivative.content.clone());
    values.insert("timestamp", derivative.timestamp.to_rfc3339());

    for (key, value) in &derivative.filterable_properties {
        values.insert(key.as_str(), filterable_value_to_string(value));
    }
    for (key, value) in &derivative.user_metadata {
        values.insert(key.as_str(), json_value_to_string(value));
    }

    let borrowed: HashMap<&str, &str> = values.iter().map(|(k, v)| (*k, v.as_str())).collect();
    crate::config::render_prompt_template(&dollar_to_brace(template), &borrowed)
}

fn filterable_value_to_string(value: &FilterablePropertyValue) -> String {
    value.to_string()
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Translate `$identifier` placeholders into the `{identifier}` form
/// [`crate::config::render_prompt_template`] understands, so this mutator
/// can reuse that substitution helper instead of duplicating it.
pub(crate) fn dollar_to_brace(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut ident = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    ident.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if ident.is_empty() {
                out.push('$');
            } else {
                out.push('{');
                out.push_str(&ident);
                out.push('}');
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[async_trait]
impl DerivativeMutator for MetadataMutator {
    async fn mutate(
        &self,
        derivative: &Derivative,
        _source_cluster: &EpisodeCluster,
    ) -> Result<Vec<Derivative>, MutatorError> {
        let content = render_metadata_template(&self.template, derivative);
        Ok(vec![Derivative {
            uuid: Uuid::new_v4(),
            content,
            ..derivative.clone()
        }])
    }
}

/// Default system prompt guiding the rewrite toward an objective,
/// third-person, anaphora-free restatement of the derivative. Matches
/// `language_model_derivative_mutator.py`'s `DEFAULT_REWRITE_SYSTEM_PROMPT`.
pub const DEFAULT_REWRITE_SYSTEM_PROMPT: &str = "\
You are an expert in linguistics.
Your task is to rewrite the DERIVATIVE content as an objective observer in the third person.

Guidelines:
- Rewrite the derivative content as an objective observer in the third person.
- Attribute propositional attitudes to the source of the DERIVATIVE content. Do not represent propositional attitudes as facts.
- Resolve anaphoric references using the CONTEXT text when rewriting the DERIVATIVE content.
- Do not include anaphora. Use names for subjects and objects instead of pronouns.
- Retain as much of the original language as possible to capture all nuance. Do not alter sentence structure or order unless necessary.
- Exclude all phatic expressions, except when the DERIVATIVE content is purely phatic.
- If an expression in the DERIVATIVE content requires a response from another participant in an interaction, then the expression is not phatic.
- If an expression in the DERIVATIVE content expresses a propositional attitude, then it is not phatic.";

/// Rewrites a derivative's content into third-person objective form via a
/// language model, given the source cluster's episodes as context. Matches
/// `LanguageModelDerivativeMutator`.
pub struct LanguageModelMutator {
    model: std::sync::Arc<dyn LanguageModel>,
    rewrite_system_prompt: String,
    max_attempts: u32,
}

impl LanguageModelMutator {
    pub fn new(model: std::sync::Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            rewrite_system_prompt: DEFAULT_REWRITE_SYSTEM_PROMPT.to_string(),
            max_attempts: 3,
        }
    }

    pub fn with_rewrite_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.rewrite_system_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl DerivativeMutator for LanguageModelMutator {
    async fn mutate(
        &self,
        derivative: &Derivative,
        source_cluster: &EpisodeCluster,
    ) -> Result<Vec<Derivative>, MutatorError> {
        let context =
            source_cluster.episodes.iter().map(|e| e.content.as_str()).collect::<Vec<_>>().join("\n");
        let user_prompt = format!(
            "You are given DERIVATIVE content derived from the CONTEXT text:\n\n\
             <CONTEXT>\n{context}\n</CONTEXT>\n\n\
             <DERIVATIVE>\n{}\n</DERIVATIVE>\n\n\
             Output only the rewritten DERIVATIVE content.",
            derivative.content
        );

        let (output_text, _tool_calls) = self
            .model
            .generate_response(
                Some(&self.rewrite_system_prompt),
                Some(&user_prompt),
                None,
                ToolChoice::Auto,
                self.max_attempts,
            )
            .await?;

        Ok(vec![Derivative {
            uuid: Uuid::new_v4(),
            content_type: ContentType::String,
            content: output_text.trim().to_string(),
            filterable_properties: source_cluster.filterable_properties.clone(),
            ..derivative.clone()
        }])
    }
}
