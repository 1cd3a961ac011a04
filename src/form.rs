//! The replay form submitted by a user.
//!
//! Wire shape: `{"mainScript": "...", "<loaded name>": "...", ...}`. Every
//! field other than `mainScript` is an override for the loaded script of the
//! same name.

use crate::error::ReplayError;
use serde_json::Value as Json;
use std::collections::BTreeMap;

pub const MAIN_SCRIPT_FIELD: &str = "mainScript";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayForm {
    pub main_script: String,
    pub overrides: BTreeMap<String, String>,
}

impl ReplayForm {
    pub fn from_json(form: &Json) -> Result<Self, ReplayError> {
        let fields = form
            .as_object()
            .ok_or_else(|| ReplayError::MalformedSubmission("form must be a JSON object".into()))?;

        let main_script = fields
            .get(MAIN_SCRIPT_FIELD)
            .ok_or_else(|| ReplayError::MalformedSubmission(format!("missing {MAIN_SCRIPT_FIELD}")))?
            .as_str()
            .ok_or_else(|| {
                ReplayError::MalformedSubmission(format!("{MAIN_SCRIPT_FIELD} must be a string"))
            })?
            .to_string();

        let mut overrides = BTreeMap::new();
        for (name, value) in fields {
            if name == MAIN_SCRIPT_FIELD {
                continue;
            }
            let text = value.as_str().ok_or_else(|| {
                ReplayError::MalformedSubmission(format!("field '{name}' must be a string"))
            })?;
            overrides.insert(name.clone(), text.to_string());
        }

        Ok(Self {
            main_script,
            overrides,
        })
    }

    /// Replacement loaded scripts for a replay.
    ///
    /// Exactly the names in `current`: the submitted text where the form has
    /// one, otherwise the current text. Form fields naming scripts the run
    /// never loaded are dropped.
    pub fn replacement_scripts(
        &self,
        current: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        current
            .iter()
            .map(|(name, text)| {
                let text = self.overrides.get(name).unwrap_or(text);
                (name.clone(), text.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fallback_keeps_unsubmitted_scripts() {
        let form = ReplayForm::from_json(&json!({
            "mainScript": "echo 'x'",
            "A": "a2",
            "Z": "never loaded"
        }))
        .unwrap();
        let current = BTreeMap::from([
            ("A".to_string(), "a1".to_string()),
            ("B".to_string(), "b1".to_string()),
        ]);
        let replaced = form.replacement_scripts(&current);
        assert_eq!(
            replaced,
            BTreeMap::from([
                ("A".to_string(), "a2".to_string()),
                ("B".to_string(), "b1".to_string()),
            ])
        );
    }

    #[test]
    fn test_malformed_forms() {
        for form in [
            json!("not an object"),
            json!({}),
            json!({"mainScript": 3}),
            json!({"mainScript": "ok", "lib": ["x"]}),
        ] {
            let err = ReplayForm::from_json(&form).unwrap_err();
            assert!(matches!(err, ReplayError::MalformedSubmission(_)), "{form}");
            assert_eq!(err.http_status(), 400);
        }
    }
}
