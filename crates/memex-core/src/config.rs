//! Configuration: YAML config tree, recursive lowercasing/merging, and
//! default prompts for the session-memory summarization hook.
//!
//! Grounded on `episodic_memory_manager.py`'s `create_episodic_memory_manager`
//! (`yaml.safe_load`, recursive `config_to_lowercase`, `_merge_configs`),
//! expressed as a `serde_yaml`-backed tree of [`serde_json::Value`] rather
//! than a typed struct per top-level key, since the original config shape is
//! itself a loosely-typed nested map keyed by model/vendor/reranker names
//! that callers pick apart dynamically (§6).

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

/// Errors surfaced while loading or merging configuration.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration root must be a mapping")]
    NotAMapping,
}

/// Default system prompt for the rolling episode summarizer, matching
/// `prompt/summary_prompt.py`'s `episode_summary_system_prompt`.
pub const DEFAULT_SUMMARY_SYSTEM_PROMPT: &str = "\
You are an AI agent that can make summary for a list of episode and previous summary. Please make a concise summary
for the giving episode. You must:
1. Make the summary as short as you can
2. Keep as much detail as you can
3. All the entities and relationships must be kept in the summary";

/// Default user prompt template for the rolling episode summarizer, matching
/// `prompt/summary_prompt.py`'s `episode_summary_user_prompt`. `{episodes}`
/// and `{summary}` are substituted by [`render_prompt_template`].
pub const DEFAULT_SUMMARY_USER_PROMPT: &str = "\
You are a helpful assistant responsible for generating a comprehensive summary of the episodes provided below.
Given one or more entities, and a list of descriptions, all related to the same entity or group of entities.
Please concatenate all of these into a single, comprehensive description. Make sure to include information collected from all the descriptions.
If the provided descriptions are contradictory, please resolve the contradictions and provide a single, coherent summary.The episodes is provided
in a timely order. When resolving the contradictions, the entities and relationships from the newer episode should be used.
Make sure it is written in third person, and include the entity names so we have the full context.
<PreviousSummary/>
{summary}
</PreviousSummary>

<Episodes/>
{episodes}
</Episodes>
The episodes are a list of individual episode in the following format:
[uuid : content]";

/// Load a YAML configuration file from disk and recursively lowercase all
/// mapping keys, matching `config_to_lowercase`.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&raw)?;
    if !value.is_object() && !value.is_null() {
        return Err(ConfigError::NotAMapping);
    }
    Ok(lowercase_keys(value))
}

/// Recursively lowercase every mapping key in a JSON-like configuration
/// value, leaving list elements and scalar values untouched.
pub fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Recursively merge `override_config` over `base_config`: nested mappings
/// merge key-by-key; any other value (including arrays) in `override_config`
/// replaces the corresponding value in `base_config` wholesale. Mirrors
/// `EpisodicMemoryManager._merge_configs`.
pub fn merge_configs(base_config: &Value, override_config: &Value) -> Value {
    match (base_config, override_config) {
        (Value::Object(base), Value::Object(over)) => {
            let mut result = base.clone();
            for (k, v) in over {
                let merged = match result.get(k) {
                    Some(existing) => merge_configs(existing, v),
                    None => v.clone(),
                };
                result.insert(k.clone(), merged);
            }
            Value::Object(result)
        }
        (_, over) => over.clone(),
    }
}

/// Render a prompt template by substituting `{key}` placeholders with the
/// given values, the way the original uses `str.format`. Unknown
/// placeholders are left as-is.
pub fn render_prompt_template(template: &str, values: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end_rel) = rest[start..].find('}') else {
            out.push_str(rest);
            return out;
        };
        let end = start + end_rel;
        out.push_str(&rest[..start]);
        let key = &rest[start + 1..end];
        match values.get(key) {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Load a prompt from a configured filesystem path, falling back to
/// `default_value` if no path is configured. Matches the original's
/// `load_prompt` helper in `create_episodic_memory_manager`.
pub fn load_prompt_or_default(
    custom_path: Option<&str>,
    default_value: &str,
) -> Result<String, ConfigError> {
    match custom_path {
        Some(path) if !path.is_empty() => {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })
        }
        _ => Ok(default_value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lowercase_keys_recurses_through_nested_maps_and_lists() {
        let value = json!({
            "Model": {"GPT": {"ModelVendor": "openai"}},
            "List": [{"Key": 1}],
        });
        let lowered = lowercase_keys(value);
        assert_eq!(lowered["model"]["gpt"]["modelvendor"], "openai");
        assert_eq!(lowered["list"][0]["key"], 1);
    }

    #[test]
    fn merge_configs_overrides_leaves_and_merges_nested_maps() {
        let base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let over = json!({"a": {"b": 10}, "e": 4});
        let merged = merge_configs(&base, &over);
        assert_eq!(merged["a"]["b"], 10);
        assert_eq!(merged["a"]["c"], 2);
        assert_eq!(merged["d"], 3);
        assert_eq!(merged["e"], 4);
    }

    #[test]
    fn merge_configs_override_array_replaces_wholesale() {
        let base = json!({"a": [1, 2, 3]});
        let over = json!({"a": [9]});
        let merged = merge_configs(&base, &over);
        assert_eq!(merged["a"], json!([9]));
    }

    #[test]
    fn render_prompt_template_substitutes_known_placeholders() {
        let mut values = HashMap::new();
        values.insert("episodes", "[a : b]");
        values.insert("summary", "prior summary");
        let rendered = render_prompt_template(DEFAULT_SUMMARY_USER_PROMPT, &values);
        assert!(rendered.contains("[a : b]"));
        assert!(rendered.contains("prior summary"));
        assert!(!rendered.contains("{episodes}"));
    }

    #[test]
    fn render_prompt_template_leaves_unknown_placeholders() {
        let values = HashMap::new();
        let rendered = render_prompt_template("hello {name}", &values);
        assert_eq!(rendered, "hello {name}");
    }

    #[test]
    fn load_prompt_or_default_falls_back_when_no_path_given() {
        let loaded = load_prompt_or_default(None, "default text").unwrap();
        assert_eq!(loaded, "default text");
    }
}
