// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for building pipelines and inspecting pushed configs

use agent_config_core::pipeline::{collector_processor_name, prepare_pipeline_processors};
use agent_config_core::{
    AttributeKey, FilterItem, FilterSet, Pipeline, PipelineOperator, PostablePipelines,
    ServerToAgent,
};
use serde_json::json;
use serde_yaml::Value;

/// `attributes.method == <method>` filter.
pub fn method_filter(method: &str) -> FilterSet {
    FilterSet::all(vec![FilterItem {
        key: AttributeKey::tag("method"),
        operator: "=".to_string(),
        value: json!(method),
    }])
}

pub fn operator(order_id: i64, id: &str, kind: &str, field: &str) -> PipelineOperator {
    PipelineOperator {
        order_id,
        id: id.to_string(),
        r#type: kind.to_string(),
        name: format!("test {kind}"),
        field: field.to_string(),
        value: (kind == "add").then(|| "val".to_string()),
        from: None,
        enabled: true,
        output: None,
    }
}

pub fn pipeline(order_id: i64, name: &str, config: Vec<PipelineOperator>) -> Pipeline {
    Pipeline {
        id: String::new(),
        order_id,
        name: name.to_string(),
        alias: name.to_string(),
        description: Some(format!("{name} description")),
        enabled: true,
        filter: method_filter("GET"),
        config,
    }
}

/// Two enabled pipelines with orderId 1 and 2.
pub fn two_pipelines() -> PostablePipelines {
    PostablePipelines {
        pipelines: vec![
            pipeline(
                1,
                "pipeline1",
                vec![operator(1, "add", "add", "attributes.test")],
            ),
            pipeline(
                2,
                "pipeline2",
                vec![operator(1, "remove", "remove", "attributes.test")],
            ),
        ],
    }
}

/// Parses the single collector config file carried by `message`.
pub fn pushed_collector_config(message: &ServerToAgent) -> Value {
    let remote = message
        .remote_config
        .as_ref()
        .expect("message carries no remote config");
    assert_eq!(
        remote.config.config_map.len(),
        1,
        "expected exactly one collector config file"
    );
    let (_, file) = remote.config.primary().expect("config map is empty");
    serde_yaml::from_str(&file.body).expect("pushed config is not valid YAML")
}

/// Asserts `message` recommends exactly `pipelines`: one processor per
/// enabled pipeline, spliced after the base processors in orderId order,
/// each routed by the pipeline's compiled filter.
pub fn assert_pipelines_recommended(message: &ServerToAgent, pipelines: &[Pipeline]) {
    let config = pushed_collector_config(message);
    let bundle = prepare_pipeline_processors(pipelines).expect("pipelines do not compile");

    let logs_processors: Vec<String> = config["service"]["pipelines"]["logs"]["processors"]
        .as_sequence()
        .expect("logs processors missing")
        .iter()
        .filter_map(|name| name.as_str().map(str::to_string))
        .collect();
    let owned: Vec<String> = logs_processors
        .iter()
        .filter(|name| name.starts_with("logstransform/pipeline_"))
        .cloned()
        .collect();
    assert_eq!(owned, bundle.processor_names, "pipeline processors mismatch");
    assert_eq!(logs_processors.first().map(String::as_str), Some("batch"));

    for pipeline in pipelines.iter().filter(|p| p.enabled) {
        let name = collector_processor_name(pipeline);
        let operators = config["processors"][name.as_str()]["operators"]
            .as_sequence()
            .unwrap_or_else(|| panic!("{name} missing from pushed config"));
        let router = operators
            .iter()
            .find(|op| op["type"].as_str() == Some("router"))
            .expect("router operator missing");
        let expr = router["routes"][0]["expr"].as_str().expect("route has no expr");
        assert_eq!(expr, pipeline.filter.to_expr().unwrap(), "{name} route expr");
    }
}
