//! Ingress section: the public load balancer and its target wiring

use serde_json::{json, Value};
use tracing::debug;

use crate::error::Error;
use crate::graph::{get_att, ref_to, Resource, ResourceGraph};
use crate::stack::compute::ComputeResources;
use crate::stack::network::NetworkResources;
use crate::stack::project_tag;
use crate::Result;

const ALB_SECURITY_GROUP: &str = "AlbSecurityGroup";
const LOAD_BALANCER: &str = "LoadBalancer";
const TARGET_GROUP: &str = "TargetGroup";
const LISTENER: &str = "Listener";
const INSTANCE_INGRESS: &str = "InstanceIngressFromAlb";

const LISTENER_PORT: u16 = 80;
const HEALTH_CHECK_PATH: &str = "/";
const HEALTH_CHECK_INTERVAL_SECONDS: u32 = 60;
const HEALTH_CHECK_TIMEOUT_SECONDS: u32 = 5;

/// Handle to the traffic entry point
pub(crate) struct IngressResources {
    /// The application load balancer
    pub load_balancer: &'static str,
}

/// Declare the internet-facing balancer, its listener and target group, and
/// wire the scaling group's instances in as targets
pub(crate) fn generate(
    graph: &mut ResourceGraph,
    network: &NetworkResources,
    compute: &ComputeResources,
) -> Result<IngressResources> {
    graph.add_resource(Resource::new(
        ALB_SECURITY_GROUP,
        "AWS::EC2::SecurityGroup",
        json!({
            "GroupDescription": "Public entry point",
            "VpcId": ref_to(network.vpc),
            "SecurityGroupIngress": [{
                "Description": "Listener port from anywhere",
                "CidrIp": "0.0.0.0/0",
                "IpProtocol": "tcp",
                "FromPort": LISTENER_PORT,
                "ToPort": LISTENER_PORT,
            }],
        }),
    ));

    let public_subnets: Vec<Value> = network.public_subnets.iter().map(|s| ref_to(s)).collect();
    let mut balancer = Resource::new(
        LOAD_BALANCER,
        "AWS::ElasticLoadBalancingV2::LoadBalancer",
        json!({
            "Type": "application",
            "Scheme": "internet-facing",
            "SecurityGroups": [get_att(ALB_SECURITY_GROUP, "GroupId")],
            "Subnets": public_subnets,
            "Tags": project_tag(),
        }),
    );
    // An internet-facing balancer cannot come up before its subnets route out
    for route in &network.public_default_routes {
        balancer = balancer.depends_on(route.as_str());
    }
    graph.add_resource(balancer);

    graph.add_resource(Resource::new(
        TARGET_GROUP,
        "AWS::ElasticLoadBalancingV2::TargetGroup",
        json!({
            "Port": compute.host_port,
            "Protocol": "HTTP",
            "TargetType": "instance",
            "VpcId": ref_to(network.vpc),
            "HealthCheckPath": HEALTH_CHECK_PATH,
            "HealthCheckIntervalSeconds": HEALTH_CHECK_INTERVAL_SECONDS,
            "HealthCheckTimeoutSeconds": HEALTH_CHECK_TIMEOUT_SECONDS,
        }),
    ));
    graph.add_resource(Resource::new(
        LISTENER,
        "AWS::ElasticLoadBalancingV2::Listener",
        json!({
            "LoadBalancerArn": ref_to(LOAD_BALANCER),
            "Port": LISTENER_PORT,
            "Protocol": "HTTP",
            "DefaultActions": [{ "Type": "forward", "TargetGroupArn": ref_to(TARGET_GROUP) }],
        }),
    ));

    // The scaling group registers its instances with the target group
    let group = graph
        .resource_mut(compute.auto_scaling_group)
        .ok_or_else(|| {
            Error::reference(format!("{} is not declared", compute.auto_scaling_group))
        })?;
    group.properties["TargetGroupARNs"] = json!([ref_to(TARGET_GROUP)]);

    graph.add_resource(Resource::new(
        INSTANCE_INGRESS,
        "AWS::EC2::SecurityGroupIngress",
        json!({
            "Description": "Health checks and forwarded requests from the balancer",
            "GroupId": get_att(compute.instance_security_group, "GroupId"),
            "SourceSecurityGroupId": get_att(ALB_SECURITY_GROUP, "GroupId"),
            "IpProtocol": "tcp",
            "FromPort": compute.host_port,
            "ToPort": compute.host_port,
        }),
    ));

    debug!("ingress section declared");
    Ok(IngressResources {
        load_balancer: LOAD_BALANCER,
    })
}
