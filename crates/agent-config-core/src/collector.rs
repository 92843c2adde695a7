// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Splices a compiled fragment into a collector configuration.
//!
//! Only processors whose name starts with the owned prefix are managed here.
//! Everything else in the agent's configuration (receivers, exporters, base
//! processors and their order) is carried over verbatim.

use serde_yaml::{Mapping, Value};

use crate::error::ConfigError;

/// Merges `fragment` into `baseline` and renders the result as YAML.
///
/// Processors in `baseline` named with `owned_prefix` are replaced by the
/// fragment's. The logs pipeline keeps its non-owned processors in their
/// original order, followed by the fragment's processor names.
pub fn merge_fragment(
    baseline: &str,
    fragment: &str,
    owned_prefix: &str,
) -> Result<String, ConfigError> {
    let mut config = parse_mapping(baseline, "agent configuration")?;
    let fragment = parse_mapping(fragment, "compiled fragment")?;

    let owned = |name: &Value| name.as_str().is_some_and(|s| s.starts_with(owned_prefix));

    let processors = child_mapping(&mut config, "processors")?;
    processors.retain(|name, _| !owned(name));
    if let Some(Value::Mapping(compiled)) = fragment.get("processors") {
        for (name, definition) in compiled {
            processors.insert(name.clone(), definition.clone());
        }
    }

    let compiled_names = fragment
        .get("service")
        .and_then(|service| service.get("pipelines"))
        .and_then(|pipelines| pipelines.get("logs"))
        .and_then(|logs| logs.get("processors"))
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();

    let service = child_mapping(&mut config, "service")?;
    let pipelines = child_mapping(service, "pipelines")?;
    let logs = child_mapping(pipelines, "logs")?;
    let mut names: Vec<Value> = match logs.get("processors") {
        Some(Value::Sequence(existing)) => {
            existing.iter().filter(|name| !owned(*name)).cloned().collect()
        }
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(ConfigError::Compilation(
                "service.pipelines.logs.processors must be a list".to_string(),
            ));
        }
    };
    names.extend(compiled_names);
    logs.insert(Value::from("processors"), Value::Sequence(names));

    Ok(serde_yaml::to_string(&Value::Mapping(config))?)
}

fn parse_mapping(yaml: &str, what: &str) -> Result<Mapping, ConfigError> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(yaml)? {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ConfigError::Compilation(format!(
            "{what} must be a YAML mapping"
        ))),
    }
}

/// Returns the mapping stored under `key`, creating it when absent or null.
fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping, ConfigError> {
    let slot = parent
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if slot.is_null() {
        *slot = Value::Mapping(Mapping::new());
    }
    match slot {
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(ConfigError::Compilation(format!(
            "'{key}' must be a YAML mapping"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "logstransform/pipeline_";

    const BASELINE: &str = r#"
receivers:
  otlp:
    protocols:
      grpc:
        endpoint: 0.0.0.0:4317
processors:
  batch:
    send_batch_size: 10000
    timeout: 10s
  logstransform/pipeline_stale:
    operators: []
exporters:
  otlp:
    endpoint: otelcol:4317
service:
  pipelines:
    logs:
      receivers: [otlp]
      processors: [batch, logstransform/pipeline_stale]
      exporters: [otlp]
"#;

    const FRAGMENT: &str = r#"
processors:
  logstransform/pipeline_a:
    operators:
      - id: noop
        type: noop
service:
  pipelines:
    logs:
      processors: [logstransform/pipeline_a]
"#;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn replaces_owned_processors_and_keeps_the_rest() {
        let merged = parse(&merge_fragment(BASELINE, FRAGMENT, PREFIX).unwrap());

        let processors = merged["processors"].as_mapping().unwrap();
        assert!(processors.contains_key("batch"));
        assert!(processors.contains_key("logstransform/pipeline_a"));
        assert!(!processors.contains_key("logstransform/pipeline_stale"));
        assert_eq!(merged["processors"]["batch"]["timeout"], Value::from("10s"));

        let logs = &merged["service"]["pipelines"]["logs"];
        assert_eq!(
            logs["processors"],
            parse("[batch, logstransform/pipeline_a]")
        );
        assert_eq!(logs["receivers"], parse("[otlp]"));
        assert_eq!(
            merged["exporters"]["otlp"]["endpoint"],
            Value::from("otelcol:4317")
        );
    }

    #[test]
    fn merging_is_idempotent() {
        let once = merge_fragment(BASELINE, FRAGMENT, PREFIX).unwrap();
        let twice = merge_fragment(&once, FRAGMENT, PREFIX).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_fragment_removes_owned_processors() {
        let empty = "processors: {}\nservice:\n  pipelines:\n    logs:\n      processors: []\n";
        let merged = parse(&merge_fragment(BASELINE, empty, PREFIX).unwrap());
        assert_eq!(
            merged["service"]["pipelines"]["logs"]["processors"],
            parse("[batch]")
        );
    }

    #[test]
    fn missing_baseline_gets_skeleton() {
        let merged = parse(&merge_fragment("", FRAGMENT, PREFIX).unwrap());
        assert_eq!(
            merged["service"]["pipelines"]["logs"]["processors"],
            parse("[logstransform/pipeline_a]")
        );
    }

    #[test]
    fn rejects_non_mapping_configuration() {
        assert!(merge_fragment("- a\n- b\n", FRAGMENT, PREFIX).is_err());
        assert!(merge_fragment("processors: [batch]\n", FRAGMENT, PREFIX).is_err());
        assert!(merge_fragment("{{{", FRAGMENT, PREFIX).is_err());
    }
}
