//! Text templates for patch values and reject messages.
//!
//! Templates use handlebars syntax and are compiled at rule-ingestion time.
//! The helper table is a curated set of pure string/list/math functions;
//! nothing in the registry touches the host environment or filesystem.
//!
//! The `#i` shorthand in a patch value template refers to the i-th captured
//! select key part; it is rewritten to an explicit `SelectKeyParts.[i]`
//! lookup before the template is parsed.

use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid template: {0}")]
    Compile(#[from] Box<handlebars::TemplateError>),
    #[error("template execution failed: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Context handed to patch value templates.
#[derive(Debug, Serialize)]
pub struct PatchTemplateContext<'a> {
    /// Namespace of the resource being patched.
    #[serde(rename = "Namespace")]
    pub namespace: &'a str,
    /// The resource document in its current (mid-pipeline) state.
    #[serde(rename = "Target")]
    pub target: &'a serde_json::Value,
    /// Concrete indices/keys captured by the patch operation's select.
    #[serde(rename = "SelectKeyParts")]
    pub select_key_parts: &'a [serde_json::Value],
    /// The node selected by the patch operation's select, if any.
    #[serde(rename = "SelectedItem")]
    pub selected_item: &'a serde_json::Value,
}

/// Context handed to reject message templates.
#[derive(Debug, Serialize)]
pub struct RejectTemplateContext<'a> {
    #[serde(rename = "Namespace")]
    pub namespace: &'a str,
    #[serde(rename = "Target")]
    pub target: &'a serde_json::Value,
}

/// A named collection of compiled templates sharing one helper registry.
///
/// Each compiled rule owns a set; registration failures surface as rule
/// validation errors, so a rule with a broken template never enters the
/// store.
pub struct TemplateSet {
    registry: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateSet")
            .field("templates", &self.registry.get_templates().len())
            .finish()
    }
}

impl TemplateSet {
    pub fn new() -> Self {
        Self {
            registry: safe_registry(),
        }
    }

    pub fn register(&mut self, name: &str, source: &str) -> Result<(), TemplateError> {
        let source = rewrite_key_part_shorthand(source);
        self.registry
            .register_template_string(name, source)
            .map_err(|e| TemplateError::Compile(Box::new(e)))
    }

    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String, TemplateError> {
        Ok(self.registry.render(name, context)?)
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

handlebars_helper!(upper: |s: String| s.to_uppercase());
handlebars_helper!(lower: |s: String| s.to_lowercase());
handlebars_helper!(trim: |s: String| s.trim().to_string());
handlebars_helper!(quote: |s: String| format!("\"{}\"", s));
handlebars_helper!(add: |a: i64, b: i64| a + b);
handlebars_helper!(sub: |a: i64, b: i64| a - b);
handlebars_helper!(mul: |a: i64, b: i64| a * b);
handlebars_helper!(join: |items: Json, sep: String| {
    match items {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(&sep),
        other => other.to_string(),
    }
});
handlebars_helper!(default: |value: Json, fallback: Json| {
    if value.is_null() { fallback.clone() } else { value.clone() }
});

/// Build the shared helper registry: handlebars built-ins plus the curated
/// pure helpers. HTML escaping is disabled; rendered output feeds JSON
/// value inference, not markup.
fn safe_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.register_helper("upper", Box::new(upper));
    registry.register_helper("lower", Box::new(lower));
    registry.register_helper("trim", Box::new(trim));
    registry.register_helper("quote", Box::new(quote));
    registry.register_helper("add", Box::new(add));
    registry.register_helper("sub", Box::new(sub));
    registry.register_helper("mul", Box::new(mul));
    registry.register_helper("join", Box::new(join));
    registry.register_helper("default", Box::new(default));
    registry
}

fn rewrite_key_part_shorthand(source: &str) -> String {
    // #\d+ cannot occur elsewhere in handlebars syntax: block helpers are
    // `#name`, never `#<digits>`.
    static SHORTHAND: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = SHORTHAND.get_or_init(|| regex::Regex::new(r"#(\d+)").expect("static regex"));
    re.replace_all(source, "SelectKeyParts.[$1]").into_owned()
}

/// Convert a rendered template value into a JSON value.
///
/// The inference ladder, applied to the trimmed rendering:
/// 1. `true`/`false`: boolean; 2. `null`: null; 3. a JSON number;
/// 4. `"…"`: a JSON string (quotes included in the input);
/// 5. `[…]`: a JSON array; 6. `{…}`: a JSON object;
/// 7. anything else: a string holding the raw text.
pub fn infer_json_value(rendered: &str) -> Result<serde_json::Value, serde_json::Error> {
    let trimmed = rendered.trim();
    match trimmed {
        "true" => return Ok(serde_json::Value::Bool(true)),
        "false" => return Ok(serde_json::Value::Bool(false)),
        "null" => return Ok(serde_json::Value::Null),
        _ => {}
    }

    if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || trimmed.starts_with('[')
        || trimmed.starts_with('{')
    {
        return serde_json::from_str(trimmed);
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_number() {
            return Ok(value);
        }
    }

    Ok(serde_json::Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_patch_context() {
        let mut set = TemplateSet::new();
        set.register("v", r#""{{Target.metadata.name}}-{{Namespace}}""#)
            .unwrap();
        let target = json!({"metadata": {"name": "web"}});
        let rendered = set
            .render(
                "v",
                &PatchTemplateContext {
                    namespace: "team-red",
                    target: &target,
                    select_key_parts: &[],
                    selected_item: &serde_json::Value::Null,
                },
            )
            .unwrap();
        assert_eq!(rendered, r#""web-team-red""#);
    }

    #[test]
    fn key_part_shorthand_is_rewritten() {
        let mut set = TemplateSet::new();
        set.register("v", "{{#0}}-{{add #1 1}}").unwrap();
        let parts = vec![json!(2), json!(5)];
        let rendered = set
            .render(
                "v",
                &PatchTemplateContext {
                    namespace: "ns",
                    target: &serde_json::Value::Null,
                    select_key_parts: &parts,
                    selected_item: &serde_json::Value::Null,
                },
            )
            .unwrap();
        assert_eq!(rendered, "2-6");
    }

    #[test]
    fn register_rejects_malformed_templates() {
        let mut set = TemplateSet::new();
        assert!(set.register("bad", "{{#if x}}no closing tag").is_err());
    }

    #[test]
    fn inference_ladder() {
        assert_eq!(infer_json_value("42").unwrap(), json!(42));
        assert_eq!(infer_json_value("-3.5").unwrap(), json!(-3.5));
        assert_eq!(infer_json_value(r#""42""#).unwrap(), json!("42"));
        assert_eq!(infer_json_value("true").unwrap(), json!(true));
        assert_eq!(infer_json_value("null").unwrap(), json!(null));
        assert_eq!(infer_json_value("[1,2]").unwrap(), json!([1, 2]));
        assert_eq!(infer_json_value(r#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(infer_json_value("prod").unwrap(), json!("prod"));
        assert_eq!(infer_json_value("10.0.0.1").unwrap(), json!("10.0.0.1"));
        assert!(infer_json_value("[1,2").is_err());
    }
}
