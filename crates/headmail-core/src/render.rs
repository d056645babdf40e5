//! Template rendering
//!
//! A thin wrapper over tera. Every render builds a one-off template set so
//! the `i18n` helper can close over the render data: it reads `locale` from
//! the data (default "en"), looks the key up under `i18n[locale]`, and falls
//! back to the key itself.

use headmail_common::{Error, Result};
use headmail_storage::DataMap;
use serde_json::Value;
use std::collections::HashMap;
use tera::{Context, Tera};

/// Pure template renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renderer;

impl Renderer {
    pub fn new() -> Self {
        Renderer
    }

    /// Render `template` against `data`. Parse and evaluation failures both
    /// surface as render errors.
    pub fn render(&self, template: &str, data: &DataMap) -> Result<String> {
        if template.is_empty() {
            return Ok(String::new());
        }

        let mut tera = Tera::default();
        tera.add_raw_template("email", template)
            .map_err(|e| Error::Render(e.to_string()))?;
        tera.register_function("i18n", I18nFn { data: data.clone() });

        let context = Context::from_serialize(Value::Object(data.clone()))
            .map_err(|e| Error::Render(e.to_string()))?;

        tera.render("email", &context)
            .map_err(|e| Error::Render(e.to_string()))
    }
}

struct I18nFn {
    data: DataMap,
}

impl tera::Function for I18nFn {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let key = args
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg("i18n requires a `key` argument"))?;

        let locale = self
            .data
            .get("locale")
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty())
            .unwrap_or("en");

        let message = self
            .data
            .get("i18n")
            .and_then(|v| v.get(locale))
            .and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .unwrap_or(key);

        Ok(Value::String(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> DataMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_render_variables() {
        let renderer = Renderer::new();
        let out = renderer
            .render("<p>hi {{ name }}</p>", &data(json!({"name": "A"})))
            .unwrap();
        assert_eq!(out, "<p>hi A</p>");
    }

    #[test]
    fn test_render_empty_template() {
        let renderer = Renderer::new();
        assert_eq!(renderer.render("", &DataMap::new()).unwrap(), "");
    }

    #[test]
    fn test_render_syntax_error() {
        let renderer = Renderer::new();
        let err = renderer.render("{{ unclosed", &DataMap::new()).unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }

    #[test]
    fn test_i18n_lookup() {
        let renderer = Renderer::new();
        let d = data(json!({
            "locale": "ko",
            "i18n": {
                "en": {"greeting": "hello"},
                "ko": {"greeting": "annyeong"}
            }
        }));
        let out = renderer.render("{{ i18n(key=\"greeting\") }}", &d).unwrap();
        assert_eq!(out, "annyeong");
    }

    #[test]
    fn test_i18n_defaults_to_en() {
        let renderer = Renderer::new();
        let d = data(json!({
            "i18n": {"en": {"greeting": "hello"}}
        }));
        let out = renderer.render("{{ i18n(key=\"greeting\") }}", &d).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_i18n_falls_back_to_key() {
        let renderer = Renderer::new();
        let out = renderer
            .render("{{ i18n(key=\"missing.key\") }}", &DataMap::new())
            .unwrap();
        assert_eq!(out, "missing.key");
    }
}
