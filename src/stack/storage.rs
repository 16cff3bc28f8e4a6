//! Storage section: the shared package file system and its security policy

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{StackConfig, StorageStrategy};
use crate::graph::{get_att, ref_to, Resource, ResourceGraph};
use crate::stack::network::NetworkResources;
use crate::stack::project_tag;

const EFS_SECURITY_GROUP: &str = "EfsSecurityGroup";
const FILE_SYSTEM: &str = "FileSystem";
const NFS_PORT: u16 = 2049;

/// Handle to the declared file system
pub(crate) struct StorageResources {
    /// Template value that resolves to the file system id, either a literal
    /// id or a `Ref` to the file system declared here
    pub file_system_id: Value,
}

/// Declare the NFS security policy, the file system for the configured
/// storage strategy and a mount target in every private subnet
pub(crate) fn generate(
    graph: &mut ResourceGraph,
    config: &StackConfig,
    network: &NetworkResources,
) -> StorageResources {
    graph.add_resource(Resource::new(
        EFS_SECURITY_GROUP,
        "AWS::EC2::SecurityGroup",
        json!({
            "GroupDescription": "NFS from inside the VPC",
            "GroupName": "sg_efs",
            "VpcId": ref_to(network.vpc),
            "SecurityGroupIngress": [{
                "Description": "NFS",
                "CidrIp": config.vpc_cidr,
                "IpProtocol": "tcp",
                "FromPort": NFS_PORT,
                "ToPort": NFS_PORT,
            }],
        }),
    ));

    let file_system_id = match &config.storage {
        StorageStrategy::UseExisting { file_system_id } => json!(file_system_id),
        StorageStrategy::CreateNew { encrypted } => {
            // The packages outlive the stack
            graph.add_resource(
                Resource::new(
                    FILE_SYSTEM,
                    "AWS::EFS::FileSystem",
                    json!({
                        "Encrypted": encrypted,
                        "LifecyclePolicies": [{ "TransitionToIA": "AFTER_14_DAYS" }],
                        "FileSystemTags": project_tag(),
                    }),
                )
                .retained(),
            );
            ref_to(FILE_SYSTEM)
        }
    };

    for (index, subnet) in network.private_subnets.iter().enumerate() {
        graph.add_resource(Resource::new(
            format!("MountTarget{}", index + 1),
            "AWS::EFS::MountTarget",
            json!({
                "FileSystemId": file_system_id.clone(),
                "SecurityGroups": [get_att(EFS_SECURITY_GROUP, "GroupId")],
                "SubnetId": ref_to(subnet),
            }),
        ));
    }

    debug!(
        mount_targets = network.private_subnets.len(),
        "storage section declared"
    );
    StorageResources { file_system_id }
}
