//! Build properties and renderable configuration values.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StepError};

/// `%(prop:name)s` or `%(prop:name:-fallback)s`.
static INTERPOLATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%\(prop:([A-Za-z0-9_.\-]+)(?::-([^)]*))?\)s").unwrap()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub value: Value,
    pub source: String,
}

/// Named, source-tagged values attached to a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    values: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>, source: impl Into<String>) {
        self.values.insert(
            name.into(),
            PropertyValue {
                value: value.into(),
                source: source.into(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).map(|p| &p.value)
    }

    pub fn source(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|p| p.source.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Substitute every `%(prop:...)s` in `template`. Unset properties
    /// without a fallback render as the empty string.
    pub fn interpolate(&self, template: &str) -> String {
        INTERPOLATION_REGEX
            .replace_all(template, |caps: &Captures| match self.get(&caps[1]) {
                Some(value) => value_to_text(value),
                None => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            })
            .into_owned()
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A configuration value that may depend on build properties.
///
/// Deserializes from a plain value, `{"property": "name", "default": ...}`
/// or `{"interpolate": "text with %(prop:name)s"}`. The plain form is tried
/// first, so `T` must not itself deserialize from maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Renderable<T> {
    Value(T),
    Property {
        property: String,
        default: Option<T>,
    },
    Interpolate {
        interpolate: String,
    },
}

impl<T> Renderable<T> {
    pub fn property(name: impl Into<String>) -> Self {
        Self::Property {
            property: name.into(),
            default: None,
        }
    }

    pub fn interpolate(template: impl Into<String>) -> Self {
        Self::Interpolate {
            interpolate: template.into(),
        }
    }
}

impl<T> From<T> for Renderable<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T: DeserializeOwned + Clone> Renderable<T> {
    pub fn render(&self, props: &Properties) -> Result<T> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Property { property, default } => match props.get(property) {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                    StepError::config(format!("property '{property}' has the wrong type: {e}"))
                }),
                None => default
                    .clone()
                    .ok_or_else(|| StepError::config(format!("property '{property}' is not set"))),
            },
            Self::Interpolate { interpolate } => {
                let text = props.interpolate(interpolate);
                serde_json::from_value(Value::String(text.clone()))
                    .or_else(|_| serde_json::from_str(&text))
                    .map_err(|e| StepError::config(format!("cannot render '{interpolate}': {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> Properties {
        let mut p = Properties::new();
        p.set("branch", "main", "Build");
        p.set("buildnumber", 7, "Build");
        p
    }

    #[test]
    fn interpolates_known_and_fallback_properties() {
        let p = props();
        assert_eq!(
            p.interpolate("checkout %(prop:branch)s #%(prop:buildnumber)s"),
            "checkout main #7"
        );
        assert_eq!(p.interpolate("%(prop:missing:-none)s"), "none");
        assert_eq!(p.interpolate("[%(prop:missing)s]"), "[]");
    }

    #[test]
    fn renders_property_references() {
        let p = props();
        let n: Renderable<u32> = Renderable::property("buildnumber");
        assert_eq!(n.render(&p).unwrap(), 7);

        let missing: Renderable<String> = Renderable::property("nope");
        assert!(matches!(missing.render(&p), Err(StepError::Config(_))));

        let defaulted: Renderable<String> = Renderable::Property {
            property: "nope".into(),
            default: Some("fallback".into()),
        };
        assert_eq!(defaulted.render(&p).unwrap(), "fallback");
    }

    #[test]
    fn interpolation_can_produce_numbers() {
        let p = props();
        let n: Renderable<u64> = Renderable::interpolate("%(prop:buildnumber)s0");
        assert_eq!(n.render(&p).unwrap(), 70);
    }

    #[test]
    fn deserializes_all_forms() {
        let plain: Renderable<String> = serde_json::from_str(r#""make""#).unwrap();
        assert_eq!(plain, Renderable::Value("make".to_string()));

        let prop: Renderable<String> = serde_json::from_str(r#"{"property": "branch"}"#).unwrap();
        assert_eq!(prop, Renderable::property("branch"));

        let interp: Renderable<String> =
            serde_json::from_str(r#"{"interpolate": "on %(prop:branch)s"}"#).unwrap();
        assert_eq!(interp.render(&props()).unwrap(), "on main");
    }

    #[test]
    fn property_default_needs_no_default_impl() {
        use crate::shell::CommandLine;

        let with_default: Renderable<CommandLine> =
            serde_json::from_str(r#"{"property": "cmd", "default": ["make", "all"]}"#).unwrap();
        assert_eq!(
            with_default,
            Renderable::Property {
                property: "cmd".to_string(),
                default: Some(CommandLine::Argv(vec!["make".into(), "all".into()])),
            }
        );

        let bare: Renderable<CommandLine> = serde_json::from_str(r#"{"property": "cmd"}"#).unwrap();
        assert_eq!(bare, Renderable::property("cmd"));
    }
}
