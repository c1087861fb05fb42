use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TemplateError {
    #[error("unterminated '{{{{' placeholder")]
    Unterminated,

    #[error("empty placeholder")]
    EmptyPlaceholder,

    #[error("variable '{0}' is not set and has no default")]
    MissingVariable(String),

    #[error("required variable '{0}' is not set")]
    MissingRequired(String),

    #[error("malformed filter '{0}' (expected required or default('value'))")]
    BadFilter(String),
}

/// Render `template`, substituting each `{{NAME}}` placeholder with the
/// value returned by `lookup`. A missing variable renders as the empty
/// string, unless the placeholder carries `|required` (an error) or
/// `|default('x')` (the default applies). A template without placeholders
/// is returned unchanged.
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<Value>,
{
    render_inner(template, lookup, false)
}

/// As `render`, but a missing variable without a default is an error.
/// Used for endpoint URIs, where silently-empty expansion would produce
/// a URI the operator never wrote.
pub fn expand<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<Value>,
{
    render_inner(template, lookup, true)
}

fn render_inner<F>(template: &str, lookup: F, strict: bool) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
        out.push_str(&substitute(after[..end].trim(), &lookup, strict)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute<F>(placeholder: &str, lookup: &F, strict: bool) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<Value>,
{
    let (name, filter) = match placeholder.split_once('|') {
        Some((name, filter)) => (name.trim_end(), Some(filter.trim())),
        None => (placeholder, None),
    };
    if name.is_empty() {
        return Err(TemplateError::EmptyPlaceholder);
    }

    if let Some(value) = lookup(name) {
        return Ok(value_to_string(&value));
    }

    match filter {
        Some("required") => Err(TemplateError::MissingRequired(name.to_string())),
        Some(f) => match parse_default(f) {
            Some(default) => Ok(default),
            None => Err(TemplateError::BadFilter(f.to_string())),
        },
        None if strict => Err(TemplateError::MissingVariable(name.to_string())),
        None => Ok(String::new()),
    }
}

/// Parse `default('value')` or `default("value")`, returning the value.
fn parse_default(filter: &str) -> Option<String> {
    let inner = filter.strip_prefix("default(")?.strip_suffix(')')?.trim();
    for quote in ['\'', '"'] {
        if let Some(v) = inner
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return Some(v.to_string());
        }
    }
    None
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> impl Fn(&str) -> Option<Value> {
        let map: std::collections::BTreeMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_basic_substitution() {
        let lookup = vars(&[("name", json!("Ada")), ("n", json!(3))]);
        assert_eq!(
            render("Hi {{name}} ({{n}})", lookup).unwrap(),
            "Hi Ada (3)"
        );
    }

    #[test]
    fn test_missing_renders_empty_unless_required() {
        let lookup = vars(&[]);
        assert_eq!(render("[{{absent}}]", &lookup).unwrap(), "[]");
        assert_eq!(
            render("{{absent|required}}", &lookup),
            Err(TemplateError::MissingRequired("absent".to_string())),
        );
    }

    #[test]
    fn test_default_filter() {
        let lookup = vars(&[("HOST", json!("broker.local"))]);
        assert_eq!(
            expand("mqtt://{{HOST|default('localhost')}}:{{PORT|default('1883')}}", &lookup)
                .unwrap(),
            "mqtt://broker.local:1883"
        );
        // Double quotes work too.
        assert_eq!(
            expand(r#"{{MISSING|default("fallback")}}"#, &lookup).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn test_expand_errors_on_missing_without_default() {
        let lookup = vars(&[]);
        assert_eq!(
            expand("file://{{WATCH_DIR}}/*.json", lookup),
            Err(TemplateError::MissingVariable("WATCH_DIR".to_string())),
        );
    }

    #[test]
    fn test_unterminated_and_malformed() {
        let lookup = vars(&[]);
        assert_eq!(render("{{oops", &lookup), Err(TemplateError::Unterminated));
        assert_eq!(render("{{}}", &lookup), Err(TemplateError::EmptyPlaceholder));
        assert_eq!(
            render("{{x|default(unquoted)}}", &lookup),
            Err(TemplateError::BadFilter("default(unquoted)".to_string())),
        );
    }

    #[test]
    fn test_value_rendering() {
        let lookup = vars(&[
            ("b", json!(true)),
            ("f", json!(2.5)),
            ("arr", json!([1, 2])),
            ("null", Value::Null),
        ]);
        assert_eq!(
            render("{{b}}/{{f}}/{{arr}}/{{null}}", lookup).unwrap(),
            "true/2.5/[1,2]/"
        );
    }

    // A string without placeholders is a fixed point of rendering.
    #[quickcheck_macros::quickcheck]
    fn prop_render_is_idempotent_without_placeholders(s: String) -> bool {
        if s.contains("{{") {
            return true; // Out of scope for this property.
        }
        let lookup = |_: &str| -> Option<Value> { None };
        let once = match render(&s, lookup) {
            Ok(once) => once,
            Err(_) => return false,
        };
        once == s && render(&once, lookup).unwrap() == once
    }
}
