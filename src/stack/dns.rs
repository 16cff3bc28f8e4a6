//! DNS section: the alias record pointing the index's name at the balancer

use serde_json::json;
use tracing::debug;

use crate::config::StackConfig;
use crate::graph::{get_att, Resource, ResourceGraph};
use crate::stack::ingress::IngressResources;

const ALIAS_RECORD: &str = "AliasRecord";

/// Declare an A alias from `{record}.{domain}` to the balancer, resolved
/// against the pre-existing hosted zone for the domain
pub(crate) fn generate(
    graph: &mut ResourceGraph,
    config: &StackConfig,
    ingress: &IngressResources,
) {
    graph.add_resource(Resource::new(
        ALIAS_RECORD,
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneName": format!("{}.", config.domain),
            "Name": config.fqdn(),
            "Type": "A",
            "AliasTarget": {
                "DNSName": get_att(ingress.load_balancer, "DNSName"),
                "HostedZoneId": get_att(ingress.load_balancer, "CanonicalHostedZoneID"),
            },
        }),
    ));
    debug!(record = %config.fqdn(), "dns section declared");
}
