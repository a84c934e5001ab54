//! Content-derived task versions: `local-` followed by the first eight hex
//! characters of a SHA-256 over the canonical JSON of the definition.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::{Result, TaskError};
use crate::runtime::task::{Parameter, TaskConfig};
use crate::wire::canonicalize;

pub const LOCAL_VERSION_PREFIX: &str = "local-";

/// Everything that contributes to a task's identity.
#[derive(Debug, Clone, Copy)]
pub struct VersionInputs<'a> {
    pub function_name: &'a str,
    pub module: &'a str,
    pub doc: Option<&'a str>,
    pub parameters: &'a [Parameter],
    pub config: &'a TaskConfig,
}

impl VersionInputs<'_> {
    fn to_value(self) -> Value {
        let parameters: Vec<Value> = self
            .parameters
            .iter()
            .map(|p| json!({"name": p.name, "type": p.type_name, "default": p.default}))
            .collect();
        json!({
            "function": self.function_name,
            "module": self.module,
            "doc": self.doc,
            "parameters": parameters,
            "config": {
                "max_parallel": self.config.max_parallel,
                "size": self.config.size,
                "timeout_ms": self.config.timeout_ms,
            },
        })
    }
}

/// Key-sorted compact JSON (`,` and `:` separators, no whitespace).
pub fn canonical_bytes(inputs: VersionInputs<'_>) -> Vec<u8> {
    canonicalize(inputs.to_value()).to_string().into_bytes()
}

pub fn local_version(inputs: VersionInputs<'_>) -> String {
    let digest = Sha256::digest(canonical_bytes(inputs));
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{LOCAL_VERSION_PREFIX}{hex}")
}

/// An explicit version is returned unchanged and the hash is skipped.
/// Explicit versions may not claim the `local-` namespace.
pub fn resolve_version(explicit: Option<&str>, inputs: VersionInputs<'_>) -> Result<String> {
    match explicit {
        Some(version) if version.starts_with(LOCAL_VERSION_PREFIX) => Err(TaskError::InvalidConfig(
            format!("explicit version {version:?} must not start with {LOCAL_VERSION_PREFIX:?}"),
        )),
        Some("") => Err(TaskError::InvalidConfig("explicit version is empty".to_string())),
        Some(version) => Ok(version.to_string()),
        None => Ok(local_version(inputs)),
    }
}

pub fn is_local_version(version: &str) -> bool {
    version
        .strip_prefix(LOCAL_VERSION_PREFIX)
        .is_some_and(|hex| hex.len() == 8 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params(default: Option<&str>) -> Vec<Parameter> {
        vec![
            Parameter {
                name: "a".into(),
                type_name: "i64".into(),
                default: None,
            },
            Parameter {
                name: "b".into(),
                type_name: "i64".into(),
                default: default.map(str::to_string),
            },
        ]
    }

    fn inputs<'a>(parameters: &'a [Parameter], config: &'a TaskConfig) -> VersionInputs<'a> {
        VersionInputs {
            function_name: "add",
            module: "tests::math",
            doc: Some("Adds two numbers."),
            parameters,
            config,
        }
    }

    #[test]
    fn local_versions_have_the_expected_shape() {
        let parameters = params(None);
        let config = TaskConfig::default();
        let version = local_version(inputs(&parameters, &config));
        assert!(is_local_version(&version), "{version}");
        assert!(!is_local_version("local-xyz"));
        assert!(!is_local_version("v1"));
    }

    #[test]
    fn changing_a_default_changes_the_version() {
        let config = TaskConfig::default();
        let plain = params(None);
        let defaulted = params(Some("3"));
        assert_ne!(
            local_version(inputs(&plain, &config)),
            local_version(inputs(&defaulted, &config))
        );
    }

    #[test]
    fn config_participates_in_the_hash() {
        let parameters = params(None);
        let one = TaskConfig::default();
        let two = TaskConfig {
            max_parallel: 2,
            ..TaskConfig::default()
        };
        assert_ne!(
            local_version(inputs(&parameters, &one)),
            local_version(inputs(&parameters, &two))
        );
    }

    #[test]
    fn explicit_versions_pass_through() {
        let parameters = params(None);
        let config = TaskConfig::default();
        assert_eq!(
            resolve_version(Some("2024.1"), inputs(&parameters, &config)).unwrap(),
            "2024.1"
        );
        assert!(resolve_version(Some("local-deadbeef"), inputs(&parameters, &config)).is_err());
        assert!(resolve_version(None, inputs(&parameters, &config))
            .unwrap()
            .starts_with(LOCAL_VERSION_PREFIX));
    }

    proptest! {
        #[test]
        fn equal_inputs_hash_equal(name in "[a-z_]{1,12}", ty in "[a-z0-9]{1,6}", max in 1usize..8) {
            let parameters = vec![Parameter { name: name.clone(), type_name: ty.clone(), default: None }];
            let config = TaskConfig { max_parallel: max, ..TaskConfig::default() };
            let again = parameters.clone();
            let first = local_version(VersionInputs { function_name: &name, module: "m", doc: None, parameters: &parameters, config: &config });
            let second = local_version(VersionInputs { function_name: &name, module: "m", doc: None, parameters: &again, config: &config.clone() });
            prop_assert_eq!(first, second);
        }

        #[test]
        fn different_function_names_hash_differently(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            prop_assume!(a != b);
            let config = TaskConfig::default();
            let left = local_version(VersionInputs { function_name: &a, module: "m", doc: None, parameters: &[], config: &config });
            let right = local_version(VersionInputs { function_name: &b, module: "m", doc: None, parameters: &[], config: &config });
            prop_assert_ne!(left, right);
        }
    }
}
