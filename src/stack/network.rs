//! Network section: VPC, subnet tiers, routing and the NAT path

use std::net::Ipv4Addr;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{parse_cidr, NatStrategy, StackConfig};
use crate::graph::{find_in_map, get_att, ref_to, select_az, Mapping, Resource, ResourceGraph};
use crate::stack::project_tag;
use crate::Result;

const VPC: &str = "Vpc";
const INTERNET_GATEWAY: &str = "InternetGateway";
const GATEWAY_ATTACHMENT: &str = "VpcGatewayAttachment";
const NAT_SECURITY_GROUP: &str = "NatSecurityGroup";
const NAT_INSTANCE: &str = "NatInstance";
const NAT_EIP: &str = "NatEip";
const NAT_GATEWAY: &str = "NatGateway";
const NAT_AMI_MAP: &str = "NatAmiMap";

/// Logical ids the later sections hang their references on
pub(crate) struct NetworkResources {
    /// The VPC every section scopes its resources to
    pub vpc: &'static str,
    /// Public subnet ids, one per availability zone
    pub public_subnets: Vec<String>,
    /// Private subnet ids, one per availability zone
    pub private_subnets: Vec<String>,
    /// Default routes of the public tier; internet-facing resources wait on these
    pub public_default_routes: Vec<String>,
}

/// Declare the VPC, a public and private subnet pair per availability zone,
/// route tables for both tiers and the configured NAT path
pub(crate) fn generate(
    graph: &mut ResourceGraph,
    config: &StackConfig,
) -> Result<NetworkResources> {
    let (base, prefix) = parse_cidr(&config.vpc_cidr)?;
    let azs = usize::from(config.max_azs);
    let slice_bits = ((azs as u32) * 2).next_power_of_two().trailing_zeros() as u8;
    let subnet_prefix = prefix + slice_bits;
    let slice = 1u32 << (32 - subnet_prefix);

    graph.add_resource(Resource::new(
        VPC,
        "AWS::EC2::VPC",
        json!({
            "CidrBlock": config.vpc_cidr,
            "EnableDnsHostnames": true,
            "EnableDnsSupport": true,
            "InstanceTenancy": "default",
            "Tags": project_tag(),
        }),
    ));
    graph.add_resource(Resource::new(
        INTERNET_GATEWAY,
        "AWS::EC2::InternetGateway",
        json!({}),
    ));
    graph.add_resource(Resource::new(
        GATEWAY_ATTACHMENT,
        "AWS::EC2::VPCGatewayAttachment",
        json!({
            "VpcId": ref_to(VPC),
            "InternetGatewayId": ref_to(INTERNET_GATEWAY),
        }),
    ));

    let mut network = NetworkResources {
        vpc: VPC,
        public_subnets: Vec::with_capacity(azs),
        private_subnets: Vec::with_capacity(azs),
        public_default_routes: Vec::with_capacity(azs),
    };

    // Public tier takes the low slices of the address range, private the high
    for az in 0..azs {
        let subnet = format!("PublicSubnet{}", az + 1);
        let route_table = format!("{subnet}RouteTable");
        let route = format!("{subnet}DefaultRoute");
        graph.add_resource(Resource::new(
            subnet.as_str(),
            "AWS::EC2::Subnet",
            json!({
                "VpcId": ref_to(VPC),
                "AvailabilityZone": select_az(az),
                "CidrBlock": slice_cidr(base, az as u32, slice, subnet_prefix),
                "MapPublicIpOnLaunch": true,
            }),
        ));
        graph.add_resource(Resource::new(
            route_table.as_str(),
            "AWS::EC2::RouteTable",
            json!({ "VpcId": ref_to(VPC) }),
        ));
        graph.add_resource(Resource::new(
            format!("{subnet}RouteTableAssociation"),
            "AWS::EC2::SubnetRouteTableAssociation",
            json!({
                "RouteTableId": ref_to(&route_table),
                "SubnetId": ref_to(&subnet),
            }),
        ));
        // The route is only valid once the gateway is attached
        graph.add_resource(
            Resource::new(
                route.as_str(),
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": ref_to(&route_table),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": ref_to(INTERNET_GATEWAY),
                }),
            )
            .depends_on(GATEWAY_ATTACHMENT),
        );
        network.public_subnets.push(subnet);
        network.public_default_routes.push(route);
    }

    let (nat_key, nat_target) = generate_nat(graph, config);

    for az in 0..azs {
        let subnet = format!("PrivateSubnet{}", az + 1);
        let route_table = format!("{subnet}RouteTable");
        graph.add_resource(Resource::new(
            subnet.as_str(),
            "AWS::EC2::Subnet",
            json!({
                "VpcId": ref_to(VPC),
                "AvailabilityZone": select_az(az),
                "CidrBlock": slice_cidr(base, (azs + az) as u32, slice, subnet_prefix),
                "MapPublicIpOnLaunch": false,
            }),
        ));
        graph.add_resource(Resource::new(
            route_table.as_str(),
            "AWS::EC2::RouteTable",
            json!({ "VpcId": ref_to(VPC) }),
        ));
        graph.add_resource(Resource::new(
            format!("{subnet}RouteTableAssociation"),
            "AWS::EC2::SubnetRouteTableAssociation",
            json!({
                "RouteTableId": ref_to(&route_table),
                "SubnetId": ref_to(&subnet),
            }),
        ));
        let mut properties = json!({
            "RouteTableId": ref_to(&route_table),
            "DestinationCidrBlock": "0.0.0.0/0",
        });
        properties[nat_key] = nat_target.clone();
        graph.add_resource(Resource::new(
            format!("{subnet}DefaultRoute"),
            "AWS::EC2::Route",
            properties,
        ));
        network.private_subnets.push(subnet);
    }

    debug!(subnets = azs * 2, "network section declared");
    Ok(network)
}

/// Declare the NAT path and return the route property that sends traffic to it
fn generate_nat(graph: &mut ResourceGraph, config: &StackConfig) -> (&'static str, Value) {
    match &config.nat {
        NatStrategy::Instance {
            instance_type,
            ami_map,
        } => {
            let mut entries = serde_json::Map::new();
            for (region, ami) in ami_map {
                entries.insert(region.clone(), json!({ "ami": ami }));
            }
            graph.add_mapping(Mapping {
                name: NAT_AMI_MAP.to_string(),
                entries: Value::Object(entries),
            });
            graph.add_resource(Resource::new(
                NAT_SECURITY_GROUP,
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": "NAT instance",
                    "VpcId": ref_to(VPC),
                    "SecurityGroupIngress": [{
                        "Description": "Forwarded traffic from inside the VPC",
                        "CidrIp": config.vpc_cidr,
                        "IpProtocol": "-1",
                    }],
                }),
            ));
            // A NAT box forwards other hosts' packets, so source/dest check must go
            graph.add_resource(
                Resource::new(
                    NAT_INSTANCE,
                    "AWS::EC2::Instance",
                    json!({
                        "ImageId": find_in_map(NAT_AMI_MAP, ref_to("AWS::Region"), "ami"),
                        "InstanceType": instance_type,
                        "SourceDestCheck": false,
                        "SubnetId": ref_to("PublicSubnet1"),
                        "SecurityGroupIds": [get_att(NAT_SECURITY_GROUP, "GroupId")],
                    }),
                )
                .depends_on(GATEWAY_ATTACHMENT),
            );
            ("InstanceId", ref_to(NAT_INSTANCE))
        }
        NatStrategy::ManagedGateway => {
            graph.add_resource(Resource::new(
                NAT_EIP,
                "AWS::EC2::EIP",
                json!({ "Domain": "vpc" }),
            ));
            graph.add_resource(
                Resource::new(
                    NAT_GATEWAY,
                    "AWS::EC2::NatGateway",
                    json!({
                        "AllocationId": get_att(NAT_EIP, "AllocationId"),
                        "SubnetId": ref_to("PublicSubnet1"),
                    }),
                )
                .depends_on(GATEWAY_ATTACHMENT),
            );
            ("NatGatewayId", ref_to(NAT_GATEWAY))
        }
    }
}

fn slice_cidr(base: Ipv4Addr, index: u32, slice: u32, prefix: u8) -> String {
    let address = Ipv4Addr::from(u32::from(base) + index * slice);
    format!("{address}/{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::stack::StackBuilder;

    fn config() -> StackConfig {
        StackConfig {
            domain: "example.com".to_string(),
            ..StackConfig::default()
        }
    }

    #[test]
    fn carves_an_even_subnet_pair_per_zone() {
        let graph = StackBuilder::build(&config()).unwrap();
        assert_eq!(graph.resources_of_type("AWS::EC2::Subnet").len(), 4);
        assert_eq!(
            graph.resource("PublicSubnet1").unwrap().properties["CidrBlock"],
            "10.0.0.0/26"
        );
        assert_eq!(
            graph.resource("PublicSubnet2").unwrap().properties["CidrBlock"],
            "10.0.0.64/26"
        );
        assert_eq!(
            graph.resource("PrivateSubnet1").unwrap().properties["CidrBlock"],
            "10.0.0.128/26"
        );
        assert_eq!(
            graph.resource("PrivateSubnet2").unwrap().properties["CidrBlock"],
            "10.0.0.192/26"
        );
    }

    #[test]
    fn three_zones_carve_eighth_slices() {
        let config = StackConfig {
            max_azs: 3,
            ..config()
        };
        let graph = StackBuilder::build(&config).unwrap();
        assert_eq!(graph.resources_of_type("AWS::EC2::Subnet").len(), 6);
        assert_eq!(
            graph.resource("PublicSubnet3").unwrap().properties["CidrBlock"],
            "10.0.0.64/27"
        );
        assert_eq!(
            graph.resource("PrivateSubnet1").unwrap().properties["CidrBlock"],
            "10.0.0.96/27"
        );
    }

    #[test]
    fn public_tier_reaches_the_internet_gateway() {
        let graph = StackBuilder::build(&config()).unwrap();
        let subnet = graph.resource("PublicSubnet1").unwrap();
        assert_eq!(subnet.properties["MapPublicIpOnLaunch"], true);
        let route = graph.resource("PublicSubnet1DefaultRoute").unwrap();
        assert_eq!(route.properties["GatewayId"], ref_to("InternetGateway"));
        assert_eq!(route.depends_on, ["VpcGatewayAttachment"]);
    }

    #[test]
    fn private_tier_routes_through_the_nat_instance() {
        let graph = StackBuilder::build(&config()).unwrap();
        for route in ["PrivateSubnet1DefaultRoute", "PrivateSubnet2DefaultRoute"] {
            let route = graph.resource(route).unwrap();
            assert_eq!(route.properties["DestinationCidrBlock"], "0.0.0.0/0");
            assert_eq!(route.properties["InstanceId"], ref_to("NatInstance"));
        }
        let nat = graph.resource("NatInstance").unwrap();
        assert_eq!(nat.properties["SourceDestCheck"], false);
        assert_eq!(nat.properties["SubnetId"], ref_to("PublicSubnet1"));
        assert_eq!(nat.properties["InstanceType"], "t2.micro");
        assert_eq!(
            nat.properties["ImageId"],
            find_in_map("NatAmiMap", ref_to("AWS::Region"), "ami")
        );
        let mapping = &graph.mappings[0];
        assert_eq!(mapping.name, "NatAmiMap");
        assert_eq!(mapping.entries["us-west-2"]["ami"], "ami-0a4bc8a5c1ed3b5a3");
    }

    #[test]
    fn managed_gateway_swaps_the_nat_path() {
        let config = StackConfig {
            nat: NatStrategy::ManagedGateway,
            ..config()
        };
        let graph = StackBuilder::build(&config).unwrap();
        assert!(graph.resource("NatInstance").is_none());
        assert!(graph.resource("NatSecurityGroup").is_none());
        assert!(graph.mappings.is_empty());
        let gateway = graph.resource("NatGateway").unwrap();
        assert_eq!(gateway.properties["AllocationId"], get_att("NatEip", "AllocationId"));
        let route = graph.resource("PrivateSubnet1DefaultRoute").unwrap();
        assert_eq!(route.properties["NatGatewayId"], ref_to("NatGateway"));
    }

    #[test]
    fn vpc_carries_dns_support_and_the_project_tag() {
        let graph = StackBuilder::build(&config()).unwrap();
        let vpc = graph.resource("Vpc").unwrap();
        assert_eq!(vpc.properties["CidrBlock"], "10.0.0.0/24");
        assert_eq!(vpc.properties["EnableDnsSupport"], true);
        assert_eq!(vpc.properties["EnableDnsHostnames"], true);
        assert_eq!(vpc.properties["Tags"][0]["Key"], "Project");
        assert_eq!(vpc.properties["Tags"][0]["Value"], ref_to("ProjectName"));
    }
}
