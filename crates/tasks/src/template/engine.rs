//! Template evaluator implementation using minijinja.

use minijinja::{Environment, UndefinedBehavior, Value};

use crate::error::TemplateError;
use crate::util::{random_string, sha256_hex, DEFAULT_RANDOM_LENGTH};

/// Prefix tag selecting the expression language.
pub const EXPRESSION_TAG: &str = "expr";

/// Expression language a template leaf is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateLanguage {
    /// `[[expr]]`: expression evaluated to a typed value.
    Expression,
    /// No prefix: text template rendered to a string.
    Text,
}

impl TemplateLanguage {
    /// Split a leaf string into its language and body.
    pub fn detect(template: &str) -> Result<(TemplateLanguage, &str), TemplateError> {
        let Some(rest) = template.strip_prefix("[[") else {
            return Ok((TemplateLanguage::Text, template));
        };
        let Some(end) = rest.find("]]") else {
            return Ok((TemplateLanguage::Text, template));
        };

        match &rest[..end] {
            EXPRESSION_TAG => Ok((TemplateLanguage::Expression, &rest[end + 2..])),
            other => Err(TemplateError::UnknownLanguage(other.to_string())),
        }
    }
}

/// Resolves embedded templates inside arbitrary JSON values.
pub struct Evaluator {
    env: Environment<'static>,
}

impl Evaluator {
    /// Create an evaluator with the custom filters and functions.
    pub fn new() -> Self {
        let mut env = Environment::new();
        // missing paths read as undefined at any depth
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_filter("upper", filter_upper);
        env.add_filter("lower", filter_lower);
        env.add_filter("trim", filter_trim);
        env.add_filter("hash", filter_hash);
        env.add_filter("default", filter_default);
        env.add_filter("d", filter_default); // alias
        env.add_filter("tojson", filter_tojson);
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);

        env.add_function("random_string", function_random_string);

        Self { env }
    }

    /// Evaluate an optional template against an optional context.
    ///
    /// An absent template stays absent; an absent context returns the
    /// template unchanged.
    pub fn evaluate(
        &self,
        template: Option<&serde_json::Value>,
        context: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, TemplateError> {
        let Some(template) = template else {
            return Ok(None);
        };
        match context {
            Some(ctx) => self.evaluate_value(template, ctx).map(Some),
            None => Ok(Some(template.clone())),
        }
    }

    /// Recursively resolve every string leaf of `template`.
    pub fn evaluate_value(
        &self,
        template: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, TemplateError> {
        match template {
            serde_json::Value::String(s) => self.evaluate_str(s, context),
            serde_json::Value::Object(obj) => {
                let mut result = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    result.insert(k.clone(), self.evaluate_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> = arr
                    .iter()
                    .map(|v| self.evaluate_value(v, context))
                    .collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(template.clone()),
        }
    }

    /// Resolve a single leaf string.
    pub fn evaluate_str(
        &self,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, TemplateError> {
        match TemplateLanguage::detect(template)? {
            (TemplateLanguage::Expression, body) => self.eval_expression(body, context),
            (TemplateLanguage::Text, body) => {
                if !is_template(body) {
                    return Ok(serde_json::Value::String(body.to_string()));
                }
                self.render(body, context).map(serde_json::Value::String)
            }
        }
    }

    /// Render a text template to a string.
    pub fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, TemplateError> {
        let tmpl = self.env.template_from_str(template)?;
        Ok(tmpl.render(Value::from_serialize(context))?)
    }

    fn eval_expression(
        &self,
        expression: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, TemplateError> {
        let expr = self.env.compile_expression(expression.trim())?;
        let value = expr.eval(Value::from_serialize(context))?;
        if value.is_undefined() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::to_value(&value).map_err(|e| TemplateError::Render(e.to_string()))
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a string contains text template syntax.
pub fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%") || s.contains("{#")
}

// Custom filters

fn filter_upper(value: Value) -> String {
    value.to_string().to_uppercase()
}

fn filter_lower(value: Value) -> String {
    value.to_string().to_lowercase()
}

fn filter_trim(value: Value) -> String {
    value.to_string().trim().to_string()
}

fn filter_hash(value: Value) -> String {
    sha256_hex(&value.to_string())
}

fn filter_default(value: Value, default: Option<Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn filter_tojson(value: Value) -> Result<String, minijinja::Error> {
    serde_json::to_string(&value)
        .map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))
}

fn filter_b64encode(value: Value) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(value.to_string().as_bytes())
}

fn filter_b64decode(value: Value) -> Result<String, minijinja::Error> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let decoded = STANDARD
        .decode(value.to_string().as_bytes())
        .map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))?;
    String::from_utf8(decoded)
        .map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))
}

fn function_random_string(length: Option<usize>) -> String {
    random_string(length.unwrap_or(DEFAULT_RANDOM_LENGTH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> serde_json::Value {
        json!({
            "client_settings": { "client_id": "acme" },
            "tasks_results": {
                "first": { "value": 5, "name": "Alice", "tags": ["a", "b"] }
            }
        })
    }

    #[test]
    fn test_text_template() {
        let ev = Evaluator::new();
        let result = ev
            .evaluate_value(&json!("Hello {{ tasks_results.first.name }}"), &ctx())
            .unwrap();
        assert_eq!(result, json!("Hello Alice"));
    }

    #[test]
    fn test_expression_returns_typed_value() {
        let ev = Evaluator::new();
        assert_eq!(
            ev.evaluate_value(&json!("[[expr]] tasks_results.first.value + 1"), &ctx())
                .unwrap(),
            json!(6)
        );
        assert_eq!(
            ev.evaluate_value(&json!("[[expr]]tasks_results.first.value > 3"), &ctx())
                .unwrap(),
            json!(true)
        );
        assert_eq!(
            ev.evaluate_value(&json!("[[expr]] tasks_results.first.tags"), &ctx())
                .unwrap(),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_missing_expression_path_is_null() {
        let ev = Evaluator::new();
        let result = ev
            .evaluate_value(&json!("[[expr]] tasks_results.missing"), &ctx())
            .unwrap();
        assert_eq!(result, json!(null));
    }

    #[test]
    fn test_nested_missing_path_is_empty() {
        let ev = Evaluator::new();
        let c = json!({ "tasks_results": {} });
        assert_eq!(
            ev.evaluate_str("[[expr]]tasks_results.skipped.ok", &c).unwrap(),
            json!(null)
        );
        assert_eq!(
            ev.evaluate_str("{{ tasks_results.skipped.ok }}", &c).unwrap(),
            json!("")
        );
        assert_eq!(
            ev.evaluate_str("[[expr]]tasks_results.skipped.ok is defined", &c).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_block_helpers() {
        let ev = Evaluator::new();
        let c = ctx();
        assert_eq!(
            ev.evaluate_str("{% filter upper %}abc{% endfilter %}", &c).unwrap(),
            json!("ABC")
        );
        assert_eq!(
            ev.evaluate_str("{% filter trim %}  x  {% endfilter %}", &c).unwrap(),
            json!("x")
        );
        assert_eq!(
            ev.evaluate_str("{% filter hash %}abc{% endfilter %}", &c).unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_random_string_function() {
        let ev = Evaluator::new();
        let result = ev.evaluate_str("{{ random_string(12) }}", &ctx()).unwrap();
        assert_eq!(result.as_str().unwrap().len(), 12);

        let result = ev.evaluate_str("{{ random_string() }}", &ctx()).unwrap();
        assert_eq!(result.as_str().unwrap().len(), DEFAULT_RANDOM_LENGTH);
    }

    #[test]
    fn test_recurses_into_containers() {
        let ev = Evaluator::new();
        let template = json!({
            "name": "{{ tasks_results.first.name | lower }}",
            "nested": [{ "count": "[[expr]] tasks_results.first.value" }, 7, true, null]
        });
        let result = ev.evaluate_value(&template, &ctx()).unwrap();
        assert_eq!(
            result,
            json!({ "name": "alice", "nested": [{ "count": 5 }, 7, true, null] })
        );
    }

    #[test]
    fn test_absent_template_and_context() {
        let ev = Evaluator::new();
        assert_eq!(ev.evaluate(None, Some(&ctx())).unwrap(), None);

        let template = json!("{{ anything }}");
        assert_eq!(ev.evaluate(Some(&template), None).unwrap(), Some(template.clone()));
    }

    #[test]
    fn test_unknown_language_is_error() {
        let ev = Evaluator::new();
        let err = ev.evaluate_str("[[jsonata]] $.x", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownLanguage(ref l) if l == "jsonata"));
    }

    #[test]
    fn test_syntax_error_propagates() {
        let ev = Evaluator::new();
        assert!(ev.evaluate_str("[[expr]] tasks_results.(", &ctx()).is_err());
        assert!(ev.evaluate_str("{{ unclosed", &ctx()).is_err());
    }

    #[test]
    fn test_plain_strings_pass_through() {
        let ev = Evaluator::new();
        assert_eq!(ev.evaluate_str("plain text", &ctx()).unwrap(), json!("plain text"));
        assert_eq!(ev.evaluate_str("[[not closed", &ctx()).unwrap(), json!("[[not closed"));
    }

    #[test]
    fn test_b64_roundtrip_filters() {
        let ev = Evaluator::new();
        assert_eq!(
            ev.evaluate_str("{{ 'hello' | b64encode }}", &ctx()).unwrap(),
            json!("aGVsbG8=")
        );
        assert_eq!(
            ev.evaluate_str("{{ 'aGVsbG8=' | b64decode }}", &ctx()).unwrap(),
            json!("hello")
        );
    }
}
