//! Expression evaluation support: error classification with human
//! suggestions, and bounded previews of compound values.

use crate::dap::types::Variable;
use serde::Serialize;

pub const MAX_EXPRESSION_LEN: usize = 10 * 1024;
pub const MAX_PREVIEW_TOTAL: usize = 4096;
pub const MAX_PREVIEW_VALUE: usize = 200;
pub const MAX_OBJECT_PROPERTIES: usize = 5;
pub const MAX_ARRAY_ITEMS: usize = 3;

/// Fixed taxonomy for evaluation failures across adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvalErrorCategory {
    SyntaxError,
    NameError,
    TypeError,
    AttributeError,
    IndexError,
    KeyError,
    ValueError,
    RuntimeError,
    ReferenceError,
    RangeError,
    UndeclaredIdentifier,
    NoMember,
    ExpressionParseError,
    LLDBError,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalErrorInfo {
    pub category: EvalErrorCategory,
    pub message: String,
    pub suggestion: String,
    pub original_error: String,
}

/// Classify a raw adapter error message into the taxonomy and attach a
/// short suggestion. The raw adapter text always rides along.
pub fn classify_eval_error(expression: &str, raw: &str) -> EvalErrorInfo {
    let lowered = raw.to_lowercase();

    let (category, suggestion) = if raw.contains("SyntaxError") || lowered.contains("syntax error")
    {
        (EvalErrorCategory::SyntaxError, syntax_suggestion(expression))
    } else if raw.contains("NameError") {
        (
            EvalErrorCategory::NameError,
            "The name is not defined in the current frame. List variables in scope with \
             get_local_variables and check the spelling."
                .to_string(),
        )
    } else if raw.contains("AttributeError") {
        (
            EvalErrorCategory::AttributeError,
            "The object has no attribute with that name. Inspect the object first to see its \
             attributes."
                .to_string(),
        )
    } else if raw.contains("IndexError") {
        (
            EvalErrorCategory::IndexError,
            "The index is out of range. Check the collection length before indexing.".to_string(),
        )
    } else if raw.contains("KeyError") {
        (
            EvalErrorCategory::KeyError,
            "The key does not exist in the mapping. Inspect the available keys first.".to_string(),
        )
    } else if raw.contains("TypeError") {
        (
            EvalErrorCategory::TypeError,
            "The operation is not valid for these types. Check the operand types in the current \
             frame."
                .to_string(),
        )
    } else if raw.contains("ValueError") {
        (
            EvalErrorCategory::ValueError,
            "The value is the right type but not acceptable here.".to_string(),
        )
    } else if raw.contains("ReferenceError") {
        (
            EvalErrorCategory::ReferenceError,
            "The identifier is not declared in this scope. List variables in scope to see what \
             is available."
                .to_string(),
        )
    } else if raw.contains("RangeError") {
        (
            EvalErrorCategory::RangeError,
            "A numeric value is outside its allowed range.".to_string(),
        )
    } else if lowered.contains("use of undeclared identifier") {
        (
            EvalErrorCategory::UndeclaredIdentifier,
            "The identifier is not visible in the selected frame. List variables in scope or \
             select a different frame."
                .to_string(),
        )
    } else if lowered.contains("no member named") {
        (
            EvalErrorCategory::NoMember,
            "The type has no member with that name. Inspect the value to see its fields."
                .to_string(),
        )
    } else if lowered.contains("failed to parse") || lowered.contains("couldn't parse") {
        (
            EvalErrorCategory::ExpressionParseError,
            syntax_suggestion(expression),
        )
    } else if raw.contains("RuntimeError") {
        (
            EvalErrorCategory::RuntimeError,
            "The expression raised at runtime. Evaluate smaller parts of it to isolate the \
             failure."
                .to_string(),
        )
    } else if lowered.contains("lldb") || lowered.starts_with("error:") {
        (
            EvalErrorCategory::LLDBError,
            "The debugger rejected the expression. Try a simpler expression without function \
             calls."
                .to_string(),
        )
    } else {
        (
            EvalErrorCategory::Unknown,
            "Evaluation failed. Check that the session is paused in a frame where the \
             expression makes sense."
                .to_string(),
        )
    };

    EvalErrorInfo {
        category,
        message: raw.to_string(),
        suggestion,
        original_error: raw.to_string(),
    }
}

/// Count-based hint for unbalanced delimiters, otherwise a generic nudge.
fn syntax_suggestion(expression: &str) -> String {
    let open = expression.matches('(').count();
    let close = expression.matches(')').count();
    if open > close {
        return format!(
            "The expression has {} unmatched opening parenthesis(es); add the missing ')'.",
            open - close
        );
    }
    if close > open {
        return format!(
            "The expression has {} unmatched closing parenthesis(es); remove the extra ')'.",
            close - open
        );
    }
    "The expression is not valid in this language. Check the syntax near the reported \
     position."
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub kind: PreviewKind,
    pub entries: Vec<PreviewEntry>,
    pub truncated: bool,
    pub total_children: usize,
}

/// Internal members filtered from previews.
fn is_internal_member(name: &str) -> bool {
    name.starts_with('_') || name == "__proto__" || name == "constructor"
}

/// Compound values look like arrays when the type hint says so, the value
/// prints like one, or every child has a pure-numeric name.
fn looks_like_array(value: &str, type_hint: Option<&str>, children: &[&Variable]) -> bool {
    if let Some(hint) = type_hint {
        let hint = hint.to_lowercase();
        if ["list", "array", "tuple", "set"]
            .iter()
            .any(|k| hint.contains(k))
        {
            return true;
        }
    }
    if value.starts_with('[') || value.starts_with('(') {
        return true;
    }
    !children.is_empty()
        && children
            .iter()
            .all(|v| v.name.chars().all(|c| c.is_ascii_digit()))
}

fn truncate_value(value: &str) -> String {
    if value.len() <= MAX_PREVIEW_VALUE {
        return value.to_string();
    }
    let mut end = MAX_PREVIEW_VALUE;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &value[..end])
}

/// Build a bounded preview for a compound value from its fetched children.
/// Limits: 5 properties / 3 items, 200 chars per value, 4096 total.
pub fn build_preview(value: &str, type_hint: Option<&str>, children: &[Variable]) -> Preview {
    let visible: Vec<&Variable> = children
        .iter()
        .filter(|v| !is_internal_member(&v.name))
        .collect();

    let as_array = looks_like_array(value, type_hint, &visible);
    let limit = if as_array {
        MAX_ARRAY_ITEMS
    } else {
        MAX_OBJECT_PROPERTIES
    };

    let mut entries = Vec::new();
    let mut total = 0usize;
    let mut truncated = visible.len() > limit;

    for child in visible.iter().take(limit) {
        let value = truncate_value(&child.value);
        let name = if as_array {
            None
        } else {
            Some(child.name.clone())
        };
        let cost = value.len() + name.as_deref().map(str::len).unwrap_or(0);
        if total + cost > MAX_PREVIEW_TOTAL {
            truncated = true;
            break;
        }
        total += cost;
        entries.push(PreviewEntry {
            name,
            value,
            type_: child.type_.clone(),
        });
    }

    Preview {
        kind: if as_array {
            PreviewKind::Array
        } else {
            PreviewKind::Object
        },
        entries,
        truncated,
        total_children: visible.len(),
    }
}
