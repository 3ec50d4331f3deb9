//! YAML parsing using yaml-rust2
//!
//! Provider artifacts (components, metadata, clusterctl config, merge patches)
//! arrive as YAML. Everything is converted to `serde_json::Value` so the rest
//! of the pipeline works on one structured representation.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

/// Error type for YAML parsing
#[derive(Debug, Clone)]
pub struct YamlError(String);

impl std::fmt::Display for YamlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for YamlError {}

impl From<YamlError> for crate::Error {
    fn from(e: YamlError) -> Self {
        crate::Error::serialization(format!("invalid YAML: {}", e))
    }
}

/// Parse a YAML (or JSON) string into a serde_json::Value.
///
/// Returns the first document, or `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a multi-document YAML stream.
///
/// Empty documents (a stray `---`, comment-only sections) are dropped, so the
/// result holds only real objects in stream order.
pub fn parse_yaml_multi(input: &str) -> Result<Vec<Value>, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    docs.into_iter()
        .filter(|d| !matches!(d, Yaml::Null | Yaml::BadValue))
        .map(yaml_to_json)
        .collect()
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metadata_document() {
        let yaml = r#"
apiVersion: clusterctl.cluster.x-k8s.io/v1alpha3
kind: Metadata
releaseSeries:
  - major: 1
    minor: 4
    contract: v1beta1
"#;
        let result = parse_yaml(yaml).unwrap();
        assert_eq!(result["kind"], "Metadata");
        assert_eq!(result["releaseSeries"][0]["major"], 1);
        assert_eq!(result["releaseSeries"][0]["contract"], "v1beta1");
    }

    #[test]
    fn json_is_valid_yaml() {
        let result = parse_yaml(r#"{"spec": {"replicas": 3}}"#).unwrap();
        assert_eq!(result["spec"]["replicas"], 3);
    }

    #[test]
    fn multi_document_stream_skips_empty_documents() {
        let yaml = r#"
---
apiVersion: v1
kind: Namespace
metadata:
  name: capi-system
---
# only a comment
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: capi-manager
  namespace: capi-system
"#;
        let docs = parse_yaml_multi(yaml).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "Namespace");
        assert_eq!(docs[1]["metadata"]["name"], "capi-manager");
    }

    #[test]
    fn empty_input_is_null() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
        assert!(parse_yaml_multi("").unwrap().is_empty());
    }

    #[test]
    fn quoted_scalars_stay_strings() {
        let result = parse_yaml("value: \"true\"\nport: \"8443\"").unwrap();
        assert_eq!(result["value"], "true");
        assert_eq!(result["port"], "8443");
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let err = parse_yaml("key: [unclosed").unwrap_err();
        let converted: crate::Error = err.into();
        assert!(converted.to_string().contains("invalid YAML"));
    }
}
