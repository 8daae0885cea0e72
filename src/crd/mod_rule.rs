//! ModRule Custom Resource Definition.
//!
//! A ModRule is a declarative rule evaluated against resources crossing the
//! admission webhook: `Patch` rules rewrite matching resources with
//! JSON-Patch operations, `Reject` rules refuse them with a rendered
//! message.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lowest accepted `executionTier`.
pub const MIN_EXECUTION_TIER: i16 = -32767;
/// Highest accepted `executionTier`.
pub const MAX_EXECUTION_TIER: i16 = 32766;

/// ModRule is a declarative admission rule.
///
/// Example:
/// ```yaml
/// apiVersion: api.modrule.io/v1beta1
/// kind: ModRule
/// metadata:
///   name: force-tcp-protocol
/// spec:
///   type: Patch
///   match:
///     - select: "$.kind"
///       matchValue: "Pod"
///   patch:
///     - op: add
///       select: "$.spec.containers[*].ports[?@.containerPort == 80]"
///       path: "/spec/containers/#0/ports/#1/protocol"
///       value: '"TCP"'
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "api.modrule.io",
    version = "v1beta1",
    kind = "ModRule",
    plural = "modrules",
    shortname = "mr",
    namespaced,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Tier", "type":"integer", "jsonPath":".spec.executionTier"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModRuleSpec {
    /// Whether this rule patches matching resources or rejects them.
    #[serde(rename = "type")]
    pub rule_type: ModRuleType,

    /// Execution order class. Rules are executed tier by tier in ascending
    /// order; the output of one tier is the input of the next. Within a
    /// tier no order is promised to authors.
    #[serde(default)]
    pub execution_tier: i16,

    /// Admission operations the rule applies to. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operation: Vec<ModRuleOperation>,

    /// Match items; the rule is in effect only when every item is positive.
    #[serde(rename = "match")]
    pub match_items: Vec<MatchItem>,

    /// Patch operations to perform on matching resources.
    /// Required for `type: Patch`, forbidden otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch: Vec<PatchOperationSpec>,

    /// Message template rendered when a `Reject` rule refuses a resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_message: Option<String>,

    /// Only meaningful on rules deployed to the cluster-wide namespace:
    /// matches the rule against resources in any namespace the regex
    /// accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace_regex: Option<String>,
}

/// A single match query.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchItem {
    /// JSONPath query yielding zero or more values. With no matchValue,
    /// matchValues or matchRegex, a non-empty result is a positive match.
    pub select: String,

    /// How selected values combine: `Any` (default) needs one passing
    /// value, `All` needs every value to pass.
    #[serde(default)]
    pub match_for: MatchForType,

    /// Exact value to compare selected results against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_value: Option<String>,

    /// Set of values; a selected result passes on membership.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_values: Vec<String>,

    /// Regular expression to compare selected results against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_regex: Option<String>,

    /// Invert the outcome of this item.
    #[serde(default)]
    pub negate: bool,
}

/// A single JSON-Patch operation template.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperationSpec {
    /// The JSON-Patch operation to perform.
    pub op: PatchOperationType,

    /// Optional JSONPath query used to expand `path`. One patch operation
    /// is produced per query result; `#0`, `#1`, … in `path` refer to the
    /// index or key each wildcard-like step of the query took.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,

    /// JSON-Pointer target path, possibly containing `#i` placeholders.
    pub path: String,

    /// Value template. The rendered text is converted to a JSON value by
    /// type inference; an absent template yields JSON `null`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ModRuleType {
    Patch,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ModRuleOperation {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MatchForType {
    #[default]
    Any,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PatchOperationType {
    Add,
    Replace,
    Remove,
}

impl std::fmt::Display for PatchOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PatchOperationType::Add => "add",
            PatchOperationType::Replace => "replace",
            PatchOperationType::Remove => "remove",
        })
    }
}

/// Structural validation failures, reported at rule-ingestion time.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("match must contain at least one item")]
    EmptyMatch,
    #[error("match item {index}: select must not be empty")]
    EmptySelect { index: usize },
    #[error(
        "match item {index}: matchValue, matchValues and matchRegex are mutually exclusive"
    )]
    ConflictingMatchCriteria { index: usize },
    #[error("executionTier {0} is outside [-32767, 32766]")]
    ExecutionTierOutOfRange(i32),
    #[error("type Patch requires at least one patch operation")]
    PatchWithoutOperations,
    #[error("patch operations are only allowed on type Patch")]
    PatchOnRejectRule,
    #[error("rejectMessage is only allowed on type Reject")]
    RejectMessageOnPatchRule,
    #[error("patch operation {index}: path must not be empty")]
    EmptyPatchPath { index: usize },
}

impl ModRuleSpec {
    /// Check the structural invariants that do not require compilation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.execution_tier < MIN_EXECUTION_TIER || self.execution_tier > MAX_EXECUTION_TIER {
            return Err(ValidationError::ExecutionTierOutOfRange(
                self.execution_tier as i32,
            ));
        }

        if self.match_items.is_empty() {
            return Err(ValidationError::EmptyMatch);
        }
        for (index, item) in self.match_items.iter().enumerate() {
            if item.select.is_empty() {
                return Err(ValidationError::EmptySelect { index });
            }
            let criteria = usize::from(item.match_value.is_some())
                + usize::from(!item.match_values.is_empty())
                + usize::from(item.match_regex.is_some());
            if criteria > 1 {
                return Err(ValidationError::ConflictingMatchCriteria { index });
            }
        }

        match self.rule_type {
            ModRuleType::Patch => {
                if self.patch.is_empty() {
                    return Err(ValidationError::PatchWithoutOperations);
                }
                if self.reject_message.is_some() {
                    return Err(ValidationError::RejectMessageOnPatchRule);
                }
            }
            ModRuleType::Reject => {
                if !self.patch.is_empty() {
                    return Err(ValidationError::PatchOnRejectRule);
                }
            }
        }

        for (index, op) in self.patch.iter().enumerate() {
            if op.path.is_empty() {
                return Err(ValidationError::EmptyPatchPath { index });
            }
        }

        Ok(())
    }
}

impl ModRule {
    /// `namespace/name`, as used in log lines and rejection messages.
    pub fn namespaced_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
