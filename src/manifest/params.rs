//! `--test-parameter` parsing and merging with framework data.

use serde_json::{Map, Value};

use super::{ManifestError, ManifestResult};

/// Keys whose repeated values are joined with `|` instead of rejected.
const JOINABLE_KEYS: &[&str] = &["test_env", "app_env"];

/// Parses `key=value` strings into a JSON object.
///
/// A parameter without `=` maps its whole text to `null`. Only the first `=`
/// splits, so values may themselves contain `=`.
pub fn parse_test_parameters<S: AsRef<str>>(parameters: &[S]) -> ManifestResult<Map<String, Value>> {
    let mut result = Map::new();

    for parameter in parameters {
        let (key, value) = parse_test_parameter(parameter.as_ref());
        let existing = result.get(&key).filter(|v| !v.is_null()).cloned();

        match existing {
            None => {
                result.insert(key, value);
            }
            Some(Value::String(previous)) if JOINABLE_KEYS.contains(&key.as_str()) => {
                let joined = match value {
                    Value::String(next) => format!("{previous}|{next}"),
                    _ => format!("{previous}|null"),
                };
                result.insert(key, Value::String(joined));
            }
            Some(_) => {
                return Err(ManifestError::InvalidParameter(format!(
                    "duplicate --test-parameter: {key}"
                )));
            }
        }
    }

    Ok(result)
}

fn parse_test_parameter(parameter: &str) -> (String, Value) {
    match parameter.split_once('=') {
        Some((key, value)) => (key.to_string(), Value::String(value.to_string())),
        None => (parameter.to_string(), Value::Null),
    }
}

/// Overlays CLI parameters on the manifest's framework data; CLI values win.
pub fn merge_parameters(
    framework_data: &Map<String, Value>,
    cli_parameters: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = framework_data.clone();
    for (key, value) in cli_parameters {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_value_pairs() {
        let params = parse_test_parameters(&["user=alice", "url=http://x?a=b", "flag"]).unwrap();

        assert_eq!(params["user"], json!("alice"));
        assert_eq!(params["url"], json!("http://x?a=b"));
        assert_eq!(params["flag"], Value::Null);
    }

    #[test]
    fn test_env_values_are_joined() {
        let params = parse_test_parameters(&[
            "test_env=A=1",
            "test_env=B=2",
            "app_env=C=3",
            "app_env=D=4",
        ])
        .unwrap();

        assert_eq!(params["test_env"], json!("A=1|B=2"));
        assert_eq!(params["app_env"], json!("C=3|D=4"));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let err = parse_test_parameters(&["user=alice", "user=bob"]).unwrap_err();
        assert_eq!(err.to_string(), "duplicate --test-parameter: user");
    }

    #[test]
    fn test_empty_input() {
        let params = parse_test_parameters::<&str>(&[]).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_cli_parameters_win() {
        let framework = json!({ "shards": "2", "locale": "en_US" });
        let cli = json!({ "shards": "4", "extra": null });

        let merged = merge_parameters(
            framework.as_object().unwrap(),
            cli.as_object().unwrap(),
        );

        assert_eq!(merged["shards"], json!("4"));
        assert_eq!(merged["locale"], json!("en_US"));
        assert!(merged.contains_key("extra"));
    }
}
