//! Compute section: cluster, container hosts, task definition and service

use serde_json::{json, Value};
use tracing::debug;

use crate::config::StackConfig;
use crate::graph::{base64, get_att, join, ref_to, Parameter, Resource, ResourceGraph};
use crate::stack::network::NetworkResources;
use crate::stack::storage::StorageResources;
use crate::stack::{project_tag, PROJECT_NAME_PARAMETER};

const CLUSTER: &str = "Cluster";
const INSTANCE_ROLE: &str = "InstanceRole";
const INSTANCE_PROFILE: &str = "InstanceProfile";
const INSTANCE_SECURITY_GROUP: &str = "InstanceSecurityGroup";
const LAUNCH_TEMPLATE: &str = "LaunchTemplate";
const AUTO_SCALING_GROUP: &str = "AutoScalingGroup";
const CAPACITY_PROVIDER: &str = "CapacityProvider";
const CAPACITY_ASSOCIATION: &str = "ClusterCapacityProviderAssociations";
const TASK_DEFINITION: &str = "TaskDefinition";
const SERVICE: &str = "Service";

const ECS_AMI_PARAMETER: &str = "EcsAmiId";
const ECS_AMI_SSM_PATH: &str = "/aws/service/ecs/optimized-ami/amazon-linux-2/recommended/image_id";
const CONTAINER_NAME: &str = "pypiserver";
const VOLUME_NAME: &str = "efs-volume";
const CONTAINER_PORT: u16 = 8080;
const HOST_PORT: u16 = 80;

/// Logical ids the ingress section wires traffic to
pub(crate) struct ComputeResources {
    /// Auto scaling group backing the cluster
    pub auto_scaling_group: &'static str,
    /// Security group of the container hosts
    pub instance_security_group: &'static str,
    /// Host port the container is published on
    pub host_port: u16,
}

/// Declare the cluster, its EC2 capacity and the package index workload
pub(crate) fn generate(
    graph: &mut ResourceGraph,
    config: &StackConfig,
    network: &NetworkResources,
    storage: &StorageResources,
) -> ComputeResources {
    graph.add_parameter(Parameter {
        name: ECS_AMI_PARAMETER.to_string(),
        parameter_type: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
        default: Some(json!(ECS_AMI_SSM_PATH)),
        description: Some(
            "ECS optimized Amazon Linux 2 image, resolved at deploy time".to_string(),
        ),
    });

    graph.add_resource(Resource::new(
        CLUSTER,
        "AWS::ECS::Cluster",
        json!({
            "ClusterName": config.cluster_name,
            "Tags": project_tag(),
        }),
    ));

    // Without this role the agent cannot register the instance with the cluster
    graph.add_resource(Resource::new(
        INSTANCE_ROLE,
        "AWS::IAM::Role",
        json!({
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": "ec2.amazonaws.com" },
                    "Action": "sts:AssumeRole",
                }],
            },
            "ManagedPolicyArns": [join("", vec![
                json!("arn:"),
                ref_to("AWS::Partition"),
                json!(":iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role"),
            ])],
        }),
    ));
    graph.add_resource(Resource::new(
        INSTANCE_PROFILE,
        "AWS::IAM::InstanceProfile",
        json!({ "Roles": [ref_to(INSTANCE_ROLE)] }),
    ));

    graph.add_resource(Resource::new(
        INSTANCE_SECURITY_GROUP,
        "AWS::EC2::SecurityGroup",
        json!({
            "GroupDescription": "Container hosts",
            "VpcId": ref_to(network.vpc),
        }),
    ));

    let boot_script = join(
        "\n",
        boot_commands(&config.cluster_name, &storage.file_system_id, &config.mount_path),
    );
    graph.add_resource(Resource::new(
        LAUNCH_TEMPLATE,
        "AWS::EC2::LaunchTemplate",
        json!({
            "LaunchTemplateData": {
                "ImageId": ref_to(ECS_AMI_PARAMETER),
                "InstanceType": config.instance_type,
                "IamInstanceProfile": { "Arn": get_att(INSTANCE_PROFILE, "Arn") },
                "SecurityGroupIds": [get_att(INSTANCE_SECURITY_GROUP, "GroupId")],
                "UserData": base64(boot_script),
            },
        }),
    ));

    let private_subnets: Vec<Value> = network.private_subnets.iter().map(|s| ref_to(s)).collect();
    graph.add_resource(Resource::new(
        AUTO_SCALING_GROUP,
        "AWS::AutoScaling::AutoScalingGroup",
        json!({
            "MinSize": "1",
            "MaxSize": "1",
            "LaunchTemplate": {
                "LaunchTemplateId": ref_to(LAUNCH_TEMPLATE),
                "Version": get_att(LAUNCH_TEMPLATE, "LatestVersionNumber"),
            },
            "VPCZoneIdentifier": private_subnets,
        }),
    ));

    graph.add_resource(Resource::new(
        CAPACITY_PROVIDER,
        "AWS::ECS::CapacityProvider",
        json!({
            "AutoScalingGroupProvider": {
                "AutoScalingGroupArn": ref_to(AUTO_SCALING_GROUP),
                "ManagedScaling": { "Status": "ENABLED", "TargetCapacity": 100 },
                "ManagedTerminationProtection": "DISABLED",
            },
        }),
    ));
    graph.add_resource(Resource::new(
        CAPACITY_ASSOCIATION,
        "AWS::ECS::ClusterCapacityProviderAssociations",
        json!({
            "Cluster": ref_to(CLUSTER),
            "CapacityProviders": [ref_to(CAPACITY_PROVIDER)],
            "DefaultCapacityProviderStrategy": [],
        }),
    ));

    graph.add_resource(Resource::new(
        TASK_DEFINITION,
        "AWS::ECS::TaskDefinition",
        json!({
            "Family": ref_to(PROJECT_NAME_PARAMETER),
            "NetworkMode": "bridge",
            "RequiresCompatibilities": ["EC2"],
            "ContainerDefinitions": [{
                "Name": CONTAINER_NAME,
                "Image": config.image,
                "Cpu": config.container_cpu,
                "Memory": config.container_memory,
                "Essential": true,
                "Command": [config.server_command],
                "PortMappings": [{
                    "ContainerPort": CONTAINER_PORT,
                    "HostPort": HOST_PORT,
                    "Protocol": "tcp",
                }],
                "MountPoints": [{
                    "ContainerPath": config.mount_path,
                    "ReadOnly": false,
                    "SourceVolume": VOLUME_NAME,
                }],
            }],
            "Volumes": [{
                "Name": VOLUME_NAME,
                "EFSVolumeConfiguration": { "FilesystemId": storage.file_system_id.clone() },
            }],
        }),
    ));

    // Placement fails until the capacity provider is associated, so the
    // service waits for the association; desired count is left to the engine
    graph.add_resource(
        Resource::new(
            SERVICE,
            "AWS::ECS::Service",
            json!({
                "ServiceName": config.service_name,
                "Cluster": ref_to(CLUSTER),
                "TaskDefinition": ref_to(TASK_DEFINITION),
                "LaunchType": "EC2",
            }),
        )
        .depends_on(CAPACITY_ASSOCIATION),
    );

    debug!(cluster = %config.cluster_name, "compute section declared");
    ComputeResources {
        auto_scaling_group: AUTO_SCALING_GROUP,
        instance_security_group: INSTANCE_SECURITY_GROUP,
        host_port: HOST_PORT,
    }
}

/// Boot script for the container hosts: join the cluster, then mount the
/// shared file system, preferring the native helper with an NFSv4.1 fallback
fn boot_commands(cluster_name: &str, file_system_id: &Value, mount_path: &str) -> Vec<Value> {
    let file_system_line = match file_system_id.as_str() {
        Some(id) => json!(format!("file_system_id_1={id}")),
        None => join("", vec![json!("file_system_id_1="), file_system_id.clone()]),
    };
    let fstab_line = join(
        "",
        vec![
            json!("test -f \"/sbin/mount.efs\" && echo \"${file_system_id_1}:/ ${efs_mount_point_1} efs defaults,_netdev\" >> /etc/fstab || echo \"${file_system_id_1}.efs."),
            ref_to("AWS::Region"),
            json!(".amazonaws.com:/ ${efs_mount_point_1} nfs4 nfsvers=4.1,rsize=1048576,wsize=1048576,hard,timeo=600,retrans=2,noresvport,_netdev 0 0\" >> /etc/fstab"),
        ],
    );
    vec![
        json!("#!/bin/bash"),
        json!(format!("echo ECS_CLUSTER={cluster_name} >> /etc/ecs/ecs.config")),
        json!("yum check-update -y"),
        json!("yum upgrade -y"),
        json!("yum install -y amazon-efs-utils"),
        json!("yum install -y nfs-utils"),
        file_system_line,
        json!(format!("efs_mount_point_1={mount_path}")),
        json!("mkdir -p \"${efs_mount_point_1}\""),
        fstab_line,
        json!("mount -a -t efs,nfs4 defaults"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageStrategy;
    use crate::stack::StackBuilder;
    use rstest::rstest;

    fn config() -> StackConfig {
        StackConfig {
            domain: "example.com".to_string(),
            ..StackConfig::default()
        }
    }

    #[test]
    fn task_definition_runs_the_shipped_container() {
        let graph = StackBuilder::build(&config()).unwrap();
        let task = graph.resource("TaskDefinition").unwrap();
        assert_eq!(task.properties["Family"], ref_to("ProjectName"));
        assert_eq!(task.properties["NetworkMode"], "bridge");
        assert_eq!(task.properties["RequiresCompatibilities"], json!(["EC2"]));
        let container = &task.properties["ContainerDefinitions"][0];
        assert_eq!(container["Name"], "pypiserver");
        assert_eq!(container["Image"], "pypiserver/pypiserver:latest");
        assert_eq!(container["Cpu"], 512);
        assert_eq!(container["Memory"], 512);
        assert_eq!(container["Essential"], true);
        assert_eq!(container["Command"], json!(["-P . -a . -o /data/packages"]));
    }

    #[test]
    fn container_port_8080_publishes_on_host_port_80() {
        let graph = StackBuilder::build(&config()).unwrap();
        let task = graph.resource("TaskDefinition").unwrap();
        let container = &task.properties["ContainerDefinitions"][0];
        assert_eq!(
            container["PortMappings"],
            json!([{ "ContainerPort": 8080, "HostPort": 80, "Protocol": "tcp" }])
        );
    }

    #[test]
    fn task_mounts_the_shared_volume_at_the_packages_path() {
        let graph = StackBuilder::build(&config()).unwrap();
        let task = graph.resource("TaskDefinition").unwrap();
        let container = &task.properties["ContainerDefinitions"][0];
        assert_eq!(
            container["MountPoints"],
            json!([{
                "ContainerPath": "/data/packages",
                "ReadOnly": false,
                "SourceVolume": "efs-volume",
            }])
        );
        let volume = &task.properties["Volumes"][0];
        assert_eq!(volume["Name"], "efs-volume");
        assert_eq!(volume["EFSVolumeConfiguration"]["FilesystemId"], ref_to("FileSystem"));
    }

    #[test]
    fn attached_storage_flows_into_the_volume_by_literal_id() {
        let config = StackConfig {
            storage: StorageStrategy::UseExisting {
                file_system_id: "fs-02396aba539111de6".to_string(),
            },
            ..config()
        };
        let graph = StackBuilder::build(&config).unwrap();
        let volume = &graph.resource("TaskDefinition").unwrap().properties["Volumes"][0];
        assert_eq!(
            volume["EFSVolumeConfiguration"]["FilesystemId"],
            "fs-02396aba539111de6"
        );
    }

    #[test]
    fn service_waits_for_cluster_capacity() {
        let graph = StackBuilder::build(&config()).unwrap();
        let service = graph.resource("Service").unwrap();
        assert_eq!(service.properties["ServiceName"], "pypiserv_serv");
        assert_eq!(service.properties["LaunchType"], "EC2");
        assert_eq!(service.properties["Cluster"], ref_to("Cluster"));
        assert!(service.properties.get("DesiredCount").is_none());
        assert_eq!(service.depends_on, ["ClusterCapacityProviderAssociations"]);

        let cluster = graph.resource("Cluster").unwrap();
        assert_eq!(cluster.properties["ClusterName"], "pypiserv_clus");
        let provider = graph.resource("CapacityProvider").unwrap();
        let asg_provider = &provider.properties["AutoScalingGroupProvider"];
        assert_eq!(asg_provider["AutoScalingGroupArn"], ref_to("AutoScalingGroup"));
        assert_eq!(asg_provider["ManagedTerminationProtection"], "DISABLED");
    }

    #[test]
    fn instances_assume_the_container_service_role() {
        let graph = StackBuilder::build(&config()).unwrap();
        let role = graph.resource("InstanceRole").unwrap();
        assert_eq!(
            role.properties["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"],
            "ec2.amazonaws.com"
        );
        assert_eq!(
            role.properties["ManagedPolicyArns"][0],
            join(
                "",
                vec![
                    json!("arn:"),
                    ref_to("AWS::Partition"),
                    json!(":iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role"),
                ],
            )
        );
        let profile = graph.resource("InstanceProfile").unwrap();
        assert_eq!(profile.properties["Roles"], json!([ref_to("InstanceRole")]));
    }

    #[test]
    fn machine_image_resolves_through_the_ssm_parameter() {
        let graph = StackBuilder::build(&config()).unwrap();
        let parameter = graph
            .parameters
            .iter()
            .find(|p| p.name == "EcsAmiId")
            .unwrap();
        assert_eq!(
            parameter.parameter_type,
            "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>"
        );
        assert_eq!(
            parameter.default,
            Some(json!("/aws/service/ecs/optimized-ami/amazon-linux-2/recommended/image_id"))
        );
        let data = &graph.resource("LaunchTemplate").unwrap().properties["LaunchTemplateData"];
        assert_eq!(data["ImageId"], ref_to("EcsAmiId"));
        assert_eq!(data["InstanceType"], "t2.micro");
    }

    #[test]
    fn auto_scaling_group_spans_the_private_subnets() {
        let graph = StackBuilder::build(&config()).unwrap();
        let group = graph.resource("AutoScalingGroup").unwrap();
        assert_eq!(group.properties["MinSize"], "1");
        assert_eq!(group.properties["MaxSize"], "1");
        assert_eq!(
            group.properties["VPCZoneIdentifier"],
            json!([ref_to("PrivateSubnet1"), ref_to("PrivateSubnet2")])
        );
        assert_eq!(
            group.properties["LaunchTemplate"]["Version"],
            get_att("LaunchTemplate", "LatestVersionNumber")
        );
    }

    #[rstest]
    #[case::created(
        StorageStrategy::CreateNew { encrypted: false },
        json!({ "Fn::Join": ["", ["file_system_id_1=", { "Ref": "FileSystem" }]] })
    )]
    #[case::existing(
        StorageStrategy::UseExisting { file_system_id: "fs-02396aba539111de6".to_string() },
        json!("file_system_id_1=fs-02396aba539111de6")
    )]
    fn hosts_boot_into_the_cluster_and_mount_storage(
        #[case] storage: StorageStrategy,
        #[case] file_system_line: Value,
    ) {
        let config = StackConfig {
            storage,
            ..config()
        };
        let graph = StackBuilder::build(&config).unwrap();
        let template = graph.resource("LaunchTemplate").unwrap();
        let user_data = &template.properties["LaunchTemplateData"]["UserData"];
        let script = &user_data["Fn::Base64"]["Fn::Join"];
        assert_eq!(script[0], "\n");
        assert_eq!(
            script[1],
            json!([
                "#!/bin/bash",
                "echo ECS_CLUSTER=pypiserv_clus >> /etc/ecs/ecs.config",
                "yum check-update -y",
                "yum upgrade -y",
                "yum install -y amazon-efs-utils",
                "yum install -y nfs-utils",
                file_system_line,
                "efs_mount_point_1=/data/packages",
                "mkdir -p \"${efs_mount_point_1}\"",
                { "Fn::Join": ["", [
                    "test -f \"/sbin/mount.efs\" && echo \"${file_system_id_1}:/ ${efs_mount_point_1} efs defaults,_netdev\" >> /etc/fstab || echo \"${file_system_id_1}.efs.",
                    { "Ref": "AWS::Region" },
                    ".amazonaws.com:/ ${efs_mount_point_1} nfs4 nfsvers=4.1,rsize=1048576,wsize=1048576,hard,timeo=600,retrans=2,noresvport,_netdev 0 0\" >> /etc/fstab"
                ]]},
                "mount -a -t efs,nfs4 defaults",
            ])
        );
    }
}
