//! Changeable-at-resubmit schema
//!
//! Describes which configuration fields a user may alter when a finished
//! job is resubmitted. Rules nest for configuration sub-objects. Fields
//! without a rule are treated as fixed.

use serde_json::Value;

use crate::error::ChangeError;

/// Whether a field may change between submissions
#[derive(Debug, Clone, Copy)]
pub enum Changeability {
    Changeable,
    Fixed,
    Nested(&'static [FieldRule]),
}

/// Rule for one named field
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub rule: Changeability,
}

impl FieldRule {
    pub const fn new(name: &'static str, rule: Changeability) -> Self {
        Self { name, rule }
    }
}

/// Checks every difference between `old` and `new` against `rules`
///
/// Returns the dotted path of the first field that changed but is not allowed to.
pub fn check_changes(rules: &[FieldRule], old: &Value, new: &Value) -> Result<(), ChangeError> {
    check_object(rules, old, new, "")
}

fn check_object(rules: &[FieldRule], old: &Value, new: &Value, prefix: &str) -> Result<(), ChangeError> {
    let empty = serde_json::Map::new();
    let old_fields = old.as_object().unwrap_or(&empty);
    let new_fields = new.as_object().unwrap_or(&empty);

    let mut names: Vec<&String> = old_fields.keys().chain(new_fields.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        let before = old_fields.get(name).unwrap_or(&Value::Null);
        let after = new_fields.get(name).unwrap_or(&Value::Null);

        let rule = rules
            .iter()
            .find(|rule| rule.name == name.as_str())
            .map(|rule| rule.rule)
            .unwrap_or(Changeability::Fixed);

        match rule {
            Changeability::Changeable => {}
            Changeability::Fixed => {
                if before != after {
                    return Err(ChangeError::NotChangeable { field: path });
                }
            }
            Changeability::Nested(inner) => {
                if before.is_object() || after.is_object() {
                    check_object(inner, before, after, &path)?;
                } else if before != after {
                    return Err(ChangeError::NotChangeable { field: path });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::{BackendConfig, CredentialRequirement};
    use serde_json::json;

    fn backend() -> BackendConfig {
        BackendConfig::new("grid", CredentialRequirement::new("lhcb"))
            .with_setting("site", json!("CERN"))
    }

    fn as_value(config: &BackendConfig) -> Value {
        serde_json::to_value(config).unwrap()
    }

    #[test]
    fn test_changeable_settings_pass() {
        let old = backend();
        let new = backend().with_setting("site", json!("RAL"));
        let result = check_changes(
            BackendConfig::resubmit_rules(),
            &as_value(&old),
            &as_value(&new),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_nested_rules_are_recursive() {
        let old = backend();
        let mut new = backend();
        new.credential = new.credential.with_group("lhcb_user");
        assert!(
            check_changes(BackendConfig::resubmit_rules(), &as_value(&old), &as_value(&new))
                .is_ok()
        );

        new.credential.vo = "atlas".to_string();
        let err = check_changes(BackendConfig::resubmit_rules(), &as_value(&old), &as_value(&new))
            .unwrap_err();
        assert_eq!(
            err,
            ChangeError::NotChangeable {
                field: "credential.vo".to_string()
            }
        );
    }

    #[test]
    fn test_fixed_field_rejected() {
        let old = backend();
        let mut new = backend();
        new.finalise_on_master = true;
        let err = check_changes(BackendConfig::resubmit_rules(), &as_value(&old), &as_value(&new))
            .unwrap_err();
        assert!(err.to_string().contains("finalise_on_master"));
    }

    #[test]
    fn test_unlisted_field_is_fixed() {
        const RULES: &[FieldRule] = &[FieldRule::new("a", Changeability::Changeable)];
        let old = json!({"a": 1, "b": 1});
        assert!(check_changes(RULES, &old, &json!({"a": 2, "b": 1})).is_ok());
        assert!(check_changes(RULES, &old, &json!({"a": 1, "b": 2})).is_err());
    }
}
