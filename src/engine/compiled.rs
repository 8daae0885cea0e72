//! Compiled form of a ModRule.
//!
//! Everything costly is compiled once when a rule enters the store: match
//! selects, match regexes, the target-namespace regex, patch selects, path
//! placeholder templates and value/reject templates. Admission-time work is
//! evaluation, regex testing and template rendering only.

use regex::Regex;
use tracing::debug;

use crate::crd::{
    MatchForType, MatchItem, ModRule, ModRuleOperation, ModRuleType, PatchOperationType,
    ValidationError,
};
use crate::expr::{Expression, Value};
use crate::template::{infer_json_value, PatchTemplateContext, TemplateError, TemplateSet};

/// Sentinel substituted for a `#i` placeholder whose capture is missing;
/// its presence fails the synthesis of the rule that produced it.
pub const BAD_INDEX: &str = "#(BADINDEX)";

#[derive(Debug, thiserror::Error)]
pub enum RuleCompileError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("invalid match select '{select}': {source}")]
    MatchSelect {
        select: String,
        source: crate::expr::ParseError,
    },
    #[error("invalid matchRegex '{pattern}': {source}")]
    MatchRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("invalid targetNamespaceRegex '{pattern}': {source}")]
    TargetNamespaceRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("invalid patch select '{select}': {source}")]
    PatchSelect {
        select: String,
        source: crate::expr::ParseError,
    },
    #[error("invalid value template for patch path '{path}': {source}")]
    ValueTemplate {
        path: String,
        source: TemplateError,
    },
    #[error("invalid rejectMessage template: {0}")]
    RejectTemplate(#[source] TemplateError),
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("patch select '{select}' failed: {source}")]
    Select {
        select: String,
        source: crate::expr::EvalError,
    },
    #[error("patch select '{select}' produced {found}, expected an object")]
    SelectNotAnObject { select: String, found: &'static str },
    #[error("failed to generate patch path from template '{template}': got '{rendered}'")]
    BadIndex { template: String, rendered: String },
    #[error("value template failed: {0}")]
    Template(#[from] TemplateError),
    #[error("rendered value is not valid JSON: {0}")]
    Inference(#[from] serde_json::Error),
}

struct CompiledPatchOperation {
    op: PatchOperationType,
    /// Compiled `{#: <select>}` when the operation carries a select.
    select: Option<Expression>,
    path: String,
    path_template: PathTemplate,
    template_name: String,
}

/// A ModRule with its compiled artifacts. Immutable once constructed;
/// the store replaces whole instances under its write lock.
pub struct CompiledModRule {
    rule: ModRule,
    target_namespace_regex: Option<Regex>,
    /// Parallel to `rule.spec.match_items`.
    match_selects: Vec<Expression>,
    /// Parallel to `rule.spec.match_items`; `None` for items without a
    /// matchRegex.
    match_regexes: Vec<Option<Regex>>,
    patch_operations: Vec<CompiledPatchOperation>,
    templates: TemplateSet,
    has_reject_template: bool,
}

const REJECT_TEMPLATE: &str = "rejectMessage";

impl CompiledModRule {
    /// Validate and compile a rule. Any failure leaves nothing behind; a
    /// rule is either fully compiled or refused.
    pub fn compile(rule: ModRule) -> Result<Self, RuleCompileError> {
        rule.spec.validate()?;

        let target_namespace_regex = match rule.spec.target_namespace_regex.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|source| {
                RuleCompileError::TargetNamespaceRegex {
                    pattern: pattern.to_string(),
                    source,
                }
            })?),
            _ => None,
        };

        let mut match_selects = Vec::with_capacity(rule.spec.match_items.len());
        let mut match_regexes = Vec::with_capacity(rule.spec.match_items.len());
        for item in &rule.spec.match_items {
            match_selects.push(Expression::compile(&item.select).map_err(|source| {
                RuleCompileError::MatchSelect {
                    select: item.select.clone(),
                    source,
                }
            })?);
            match_regexes.push(match item.match_regex.as_deref() {
                Some(pattern) => {
                    Some(Regex::new(pattern).map_err(|source| RuleCompileError::MatchRegex {
                        pattern: pattern.to_string(),
                        source,
                    })?)
                }
                None => None,
            });
        }

        let mut templates = TemplateSet::new();
        let mut patch_operations = Vec::with_capacity(rule.spec.patch.len());
        for (index, op) in rule.spec.patch.iter().enumerate() {
            let select = match op.select.as_deref() {
                Some(select) => {
                    let wrapped = format!("{{#: {}}}", select);
                    Some(Expression::compile(&wrapped).map_err(|source| {
                        RuleCompileError::PatchSelect {
                            select: select.to_string(),
                            source,
                        }
                    })?)
                }
                None => None,
            };

            let template_name = format!("patch-{}", index);
            // An absent value template produces JSON null.
            let value = op.value.as_deref().unwrap_or("null");
            templates
                .register(&template_name, value)
                .map_err(|source| RuleCompileError::ValueTemplate {
                    path: op.path.clone(),
                    source,
                })?;

            patch_operations.push(CompiledPatchOperation {
                op: op.op,
                select,
                path: op.path.clone(),
                path_template: PathTemplate::parse(&op.path),
                template_name,
            });
        }

        let has_reject_template = match rule.spec.reject_message.as_deref() {
            Some(message) => {
                templates
                    .register(REJECT_TEMPLATE, message)
                    .map_err(RuleCompileError::RejectTemplate)?;
                true
            }
            None => false,
        };

        Ok(Self {
            rule,
            target_namespace_regex,
            match_selects,
            match_regexes,
            patch_operations,
            templates,
            has_reject_template,
        })
    }

    pub fn rule(&self) -> &ModRule {
        &self.rule
    }

    pub fn rule_type(&self) -> ModRuleType {
        self.rule.spec.rule_type
    }

    pub fn execution_tier(&self) -> i16 {
        self.rule.spec.execution_tier
    }

    pub fn name(&self) -> String {
        kube::ResourceExt::name_any(&self.rule)
    }

    pub fn namespaced_name(&self) -> String {
        self.rule.namespaced_name()
    }

    /// Whether the rule applies to the given admission operation. An empty
    /// operation list means all operations.
    pub fn applies_to(&self, operation: ModRuleOperation) -> bool {
        self.rule.spec.operation.is_empty() || self.rule.spec.operation.contains(&operation)
    }

    /// Cluster-bucket candidacy: a rule with a target-namespace regex
    /// matches the namespaces its regex accepts; a rule without one matches
    /// only non-namespaced resources.
    pub fn matches_target_namespace(&self, namespace: &str) -> bool {
        match &self.target_namespace_regex {
            Some(regex) => regex.is_match(namespace),
            None => namespace.is_empty(),
        }
    }

    /// Run all match items against a document; the rule matches only when
    /// every item is positive.
    pub fn is_match(&self, doc: &Value) -> bool {
        self.rule
            .spec
            .match_items
            .iter()
            .enumerate()
            .all(|(index, item)| self.match_item(index, item, doc))
    }

    fn match_item(&self, index: usize, item: &MatchItem, doc: &Value) -> bool {
        let select = &self.match_selects[index];
        let result = match select.eval(doc) {
            Ok(result) => result,
            Err(error) => {
                // Selecting into a missing key is a normal negative match,
                // not a fault.
                debug!(select = %item.select, %error, "match select failed");
                return item.negate;
            }
        };

        let mut saw_undefined = false;
        let values: Vec<Value> = match result {
            Value::Null | Value::Undefined => return item.negate,
            // A boolean query result is the match outcome itself; value
            // criteria are not consulted.
            Value::Bool(outcome) => return outcome != item.negate,
            Value::Array(items) => {
                let kept: Vec<Value> =
                    items.iter().filter(|v| !v.is_undefined()).cloned().collect();
                saw_undefined = kept.len() != items.len();
                kept
            }
            scalar => vec![scalar],
        };

        if values.is_empty() {
            return item.negate;
        }

        // All of the results must pass, but some of them were undefined.
        if item.match_for == MatchForType::All && saw_undefined {
            return item.negate;
        }

        let regex = self.match_regexes[index].as_ref();
        let passes = |value: &Value| value_passes(item, regex, &value.to_plain_string());

        let positive = match item.match_for {
            MatchForType::Any => values.iter().any(passes),
            MatchForType::All => values.iter().all(passes),
        };

        positive != item.negate
    }

    /// Render this rule's patch operations against the current document,
    /// producing a decoded JSON-Patch. Any failure aborts the whole rule.
    pub fn synthesize_patch(
        &self,
        namespace: &str,
        doc: &serde_json::Value,
    ) -> Result<json_patch::Patch, SynthesisError> {
        let expr_doc = Value::from(doc);
        let mut operations = Vec::new();

        for op in &self.patch_operations {
            let mut targets = Vec::new();

            if let Some(select) = &op.select {
                let result = select.eval(&expr_doc).map_err(|source| SynthesisError::Select {
                    select: select.source().to_string(),
                    source,
                })?;
                let map = match result {
                    Value::Object(map) => map,
                    other => {
                        return Err(SynthesisError::SelectNotAnObject {
                            select: select.source().to_string(),
                            found: other.type_name(),
                        })
                    }
                };
                for (key, value) in map {
                    let parts = key_parts_from_select_key(&key);
                    let path = op.path_template.render(&parts);
                    if path.contains(BAD_INDEX) {
                        return Err(SynthesisError::BadIndex {
                            template: op.path.clone(),
                            rendered: path,
                        });
                    }
                    let selected = value.to_json().unwrap_or(serde_json::Value::Null);
                    targets.push((path, parts, selected));
                }
            } else {
                targets.push((op.path.clone(), Vec::new(), serde_json::Value::Null));
            }

            for (path, parts, selected) in targets {
                let context = PatchTemplateContext {
                    namespace,
                    target: doc,
                    select_key_parts: &parts,
                    selected_item: &selected,
                };
                let rendered = self.templates.render(&op.template_name, &context)?;
                let value = infer_json_value(&rendered)?;

                let operation = match op.op {
                    PatchOperationType::Remove => {
                        serde_json::json!({"op": "remove", "path": path})
                    }
                    other => serde_json::json!({"op": other.to_string(), "path": path, "value": value}),
                };
                operations.push(serde_json::from_value(operation)?);
            }
        }

        Ok(json_patch::Patch(operations))
    }

    /// Render the rejection message for this rule. A rule without a
    /// template, or whose template fails, rejects with its bare
    /// `namespace/name` (the failure is logged, never fatal).
    pub fn rejection_message(&self, namespace: &str, doc: &serde_json::Value) -> String {
        if !self.has_reject_template {
            return self.namespaced_name();
        }
        let context = crate::template::RejectTemplateContext {
            namespace,
            target: doc,
        };
        match self.templates.render(REJECT_TEMPLATE, &context) {
            Ok(message) => format!("{}: \"{}\"", self.namespaced_name(), message),
            Err(error) => {
                tracing::warn!(
                    rule = %self.namespaced_name(),
                    %error,
                    "rejectMessage template failed"
                );
                self.namespaced_name()
            }
        }
    }
}

impl std::fmt::Debug for CompiledModRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModRule")
            .field("rule", &self.namespaced_name())
            .field("type", &self.rule.spec.rule_type)
            .field("tier", &self.rule.spec.execution_tier)
            .finish()
    }
}

fn value_passes(item: &MatchItem, regex: Option<&Regex>, value: &str) -> bool {
    if let Some(expected) = &item.match_value {
        return value == expected;
    }
    if !item.match_values.is_empty() {
        return item.match_values.iter().any(|v| v == value);
    }
    if let Some(regex) = regex {
        return regex.is_match(value);
    }
    // No criteria configured: a selected value is a positive match.
    true
}

/// A patch path with `#i` placeholders split into literal and placeholder
/// parts, resolved against captured select key parts at synthesis time.
#[derive(Debug)]
struct PathTemplate {
    parts: Vec<PathPart>,
}

#[derive(Debug)]
enum PathPart {
    Literal(String),
    Placeholder(usize),
}

impl PathTemplate {
    fn parse(path: &str) -> Self {
        static PLACEHOLDER: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        let re = PLACEHOLDER.get_or_init(|| Regex::new(r"#(\d+)").expect("static regex"));

        let mut parts = Vec::new();
        let mut last = 0;
        for captures in re.captures_iter(path) {
            let whole = captures.get(0).expect("capture 0 always present");
            if whole.start() > last {
                parts.push(PathPart::Literal(path[last..whole.start()].to_string()));
            }
            let index = captures[1].parse().unwrap_or(usize::MAX);
            parts.push(PathPart::Placeholder(index));
            last = whole.end();
        }
        if last < path.len() {
            parts.push(PathPart::Literal(path[last..].to_string()));
        }
        Self { parts }
    }

    fn render(&self, key_parts: &[serde_json::Value]) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                PathPart::Literal(text) => out.push_str(text),
                PathPart::Placeholder(index) => match key_parts.get(*index) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => out.push_str(BAD_INDEX),
                },
            }
        }
        out
    }
}

/// Convert a select key of the form `$["0"]["abc"]["3"]` into its parts
/// `[0, "abc", 3]`, turning digit-only segments into numbers.
fn key_parts_from_select_key(select_key: &str) -> Vec<serde_json::Value> {
    static SEGMENT: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = SEGMENT.get_or_init(|| Regex::new(r#"\["([^\["\]]+)"\]"#).expect("static regex"));

    re.captures_iter(select_key)
        .map(|captures| {
            let part = &captures[1];
            match part.parse::<i64>() {
                Ok(number) => serde_json::Value::Number(number.into()),
                Err(_) => serde_json::Value::String(part.to_string()),
            }
        })
        .collect()
}
