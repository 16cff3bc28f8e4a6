//! Stack assembly
//!
//! [`StackBuilder`] declares the whole deployment in dependency order:
//! network, storage, compute, ingress, then DNS. Each section appends its
//! resources to the shared [`ResourceGraph`] and returns a small handle of
//! logical ids the next sections reference.

mod compute;
mod dns;
mod ingress;
mod network;
mod storage;

use serde_json::{json, Value};
use tracing::info;

use crate::config::StackConfig;
use crate::graph::{get_att, ref_to, Output, Parameter, ResourceGraph};
use crate::Result;

/// Template parameter naming the project; tags and the task family use it
pub(crate) const PROJECT_NAME_PARAMETER: &str = "ProjectName";

const LOAD_BALANCER_DNS_OUTPUT: &str = "LoadBalancerDNS";

/// Assembles the resource graph for one package index deployment
pub struct StackBuilder;

impl StackBuilder {
    /// Validate the config, declare every section in dependency order and
    /// check the finished graph for dangling references
    pub fn build(config: &StackConfig) -> Result<ResourceGraph> {
        config.validate()?;

        let mut graph = ResourceGraph::new(format!(
            "{} package index on ECS behind an application load balancer",
            config.project_name
        ));
        graph.add_parameter(Parameter {
            name: PROJECT_NAME_PARAMETER.to_string(),
            parameter_type: "String".to_string(),
            default: Some(json!(config.project_name)),
            description: None,
        });

        let network = network::generate(&mut graph, config)?;
        let storage = storage::generate(&mut graph, config, &network);
        let compute = compute::generate(&mut graph, config, &network, &storage);
        let ingress = ingress::generate(&mut graph, &network, &compute)?;
        dns::generate(&mut graph, config, &ingress);

        graph.add_output(Output {
            name: LOAD_BALANCER_DNS_OUTPUT.to_string(),
            description: Some("Public DNS name of the load balancer".to_string()),
            value: get_att(ingress.load_balancer, "DNSName"),
        });

        graph.validate_references()?;
        info!(
            resources = graph.resources.len(),
            project = %config.project_name,
            "stack synthesized"
        );
        Ok(graph)
    }
}

/// Tag set tying a resource to the project parameter
pub(crate) fn project_tag() -> Value {
    json!([{ "Key": "Project", "Value": ref_to(PROJECT_NAME_PARAMETER) }])
}
