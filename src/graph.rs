//! Resource graph for CloudFormation template synthesis
//!
//! The graph holds the four template sections in declaration order and
//! serializes straight into template JSON or YAML. Cross-references between
//! nodes are expressed with the intrinsic helpers below and checked by
//! [`ResourceGraph::validate_references`] before the template is emitted.

use std::collections::HashSet;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::Error;
use crate::Result;

/// Template format version emitted at the top of every template
const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Names resolvable without being declared anywhere in the template
const PSEUDO_PARAMETERS: &[&str] = &[
    "AWS::AccountId",
    "AWS::NoValue",
    "AWS::Partition",
    "AWS::Region",
    "AWS::StackName",
    "AWS::URLSuffix",
];

/// A single resource node in the graph
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    /// Logical id the rest of the graph uses to point at this node
    #[serde(skip)]
    pub logical_id: String,
    /// CloudFormation resource type, e.g. `AWS::EC2::VPC`
    #[serde(rename = "Type")]
    pub resource_type: String,
    /// Resource properties as template JSON
    #[serde(skip_serializing_if = "no_properties")]
    pub properties: Value,
    /// Explicit ordering edges on top of the implicit `Ref` edges
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// What happens to the underlying resource when the node is removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl Resource {
    /// Create a resource with the given logical id, type and properties
    pub fn new(
        logical_id: impl Into<String>,
        resource_type: impl Into<String>,
        properties: Value,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            resource_type: resource_type.into(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
        }
    }

    /// Add an explicit ordering dependency on another resource
    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }

    /// Keep the underlying resource when the node is deleted from the stack
    pub fn retained(mut self) -> Self {
        self.deletion_policy = Some("Retain".to_string());
        self
    }
}

/// A template parameter resolved by the engine at deploy time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    /// Name the graph uses to `Ref` this parameter
    #[serde(skip)]
    pub name: String,
    /// Parameter type, e.g. `String` or an SSM-backed image id
    #[serde(rename = "Type")]
    pub parameter_type: String,
    /// Value used when the caller does not override the parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description shown by the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A static lookup table consulted with `Fn::FindInMap`
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct Mapping {
    /// Name the graph uses to look this mapping up
    #[serde(skip)]
    pub name: String,
    /// Two-level key-to-value table as template JSON
    pub entries: Value,
}

/// A value exported from the synthesized stack
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    /// Output name
    #[serde(skip)]
    pub name: String,
    /// Human-readable description shown by the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Exported value, usually an intrinsic
    pub value: Value,
}

/// Ordered collection of template sections forming one deployable stack
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    /// Template description
    pub description: Option<String>,
    /// Deploy-time parameters in declaration order
    pub parameters: Vec<Parameter>,
    /// Static lookup tables in declaration order
    pub mappings: Vec<Mapping>,
    /// Resource nodes in declaration order
    pub resources: Vec<Resource>,
    /// Exported values in declaration order
    pub outputs: Vec<Output>,
}

impl ResourceGraph {
    /// Create an empty graph with the given template description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    /// Append a parameter
    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    /// Append a mapping
    pub fn add_mapping(&mut self, mapping: Mapping) {
        self.mappings.push(mapping);
    }

    /// Append a resource node
    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    /// Append an output
    pub fn add_output(&mut self, output: Output) {
        self.outputs.push(output);
    }

    /// Look up a resource by logical id
    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.logical_id == logical_id)
    }

    /// Look up a resource by logical id for in-place edits
    pub fn resource_mut(&mut self, logical_id: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.logical_id == logical_id)
    }

    /// All resources of the given CloudFormation type, in declaration order
    pub fn resources_of_type(&self, resource_type: &str) -> Vec<&Resource> {
        self.resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .collect()
    }

    /// Check that every `Ref`, `Fn::GetAtt`, `Fn::FindInMap` and `DependsOn`
    /// in the graph points at a declared node, parameter or mapping
    pub fn validate_references(&self) -> Result<()> {
        let resources: HashSet<&str> =
            self.resources.iter().map(|r| r.logical_id.as_str()).collect();
        let parameters: HashSet<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        let mappings: HashSet<&str> = self.mappings.iter().map(|m| m.name.as_str()).collect();

        for resource in &self.resources {
            for dependency in &resource.depends_on {
                if !resources.contains(dependency.as_str()) {
                    return Err(Error::reference(format!(
                        "{} depends on undeclared resource {dependency}",
                        resource.logical_id
                    )));
                }
            }
            check_value(
                &resource.logical_id,
                &resource.properties,
                &resources,
                &parameters,
                &mappings,
            )?;
        }
        for output in &self.outputs {
            check_value(&output.name, &output.value, &resources, &parameters, &mappings)?;
        }
        Ok(())
    }

    /// Serialize the graph as pretty-printed template JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Serialize the graph as template YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

impl Serialize for ResourceGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut template = serializer.serialize_map(None)?;
        template.serialize_entry("AWSTemplateFormatVersion", TEMPLATE_FORMAT_VERSION)?;
        if let Some(description) = &self.description {
            template.serialize_entry("Description", description)?;
        }
        if !self.parameters.is_empty() {
            template.serialize_entry("Parameters", &Section(&self.parameters))?;
        }
        if !self.mappings.is_empty() {
            template.serialize_entry("Mappings", &Section(&self.mappings))?;
        }
        template.serialize_entry("Resources", &Section(&self.resources))?;
        if !self.outputs.is_empty() {
            template.serialize_entry("Outputs", &Section(&self.outputs))?;
        }
        template.end()
    }
}

/// Resources with nothing to say omit the `Properties` key entirely
fn no_properties(value: &Value) -> bool {
    value.is_null() || value.as_object().map_or(false, |o| o.is_empty())
}

/// Entries that serialize under their own name inside a template section
trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Resource {
    fn key(&self) -> &str {
        &self.logical_id
    }
}

impl Keyed for Parameter {
    fn key(&self) -> &str {
        &self.name
    }
}

impl Keyed for Mapping {
    fn key(&self) -> &str {
        &self.name
    }
}

impl Keyed for Output {
    fn key(&self) -> &str {
        &self.name
    }
}

/// Template section serialized as an object keyed by entry name, preserving
/// the declaration order of the underlying slice
struct Section<'a, T>(&'a [T]);

impl<T: Keyed + Serialize> Serialize for Section<'_, T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut section = serializer.serialize_map(Some(self.0.len()))?;
        for entry in self.0 {
            section.serialize_entry(entry.key(), entry)?;
        }
        section.end()
    }
}

/// `{"Ref": logical_id}`
pub fn ref_to(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// `{"Fn::GetAtt": [logical_id, attribute]}`
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

/// `{"Fn::FindInMap": [mapping, top_key, second_key]}`
pub fn find_in_map(mapping: &str, top_key: Value, second_key: &str) -> Value {
    json!({ "Fn::FindInMap": [mapping, top_key, second_key] })
}

/// Availability zone at `index` of the region's zone list
pub fn select_az(index: usize) -> Value {
    json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] })
}

/// `{"Fn::Join": [delimiter, parts]}`
pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

/// `{"Fn::Base64": value}`
pub fn base64(value: Value) -> Value {
    json!({ "Fn::Base64": value })
}

fn check_value(
    owner: &str,
    value: &Value,
    resources: &HashSet<&str>,
    parameters: &HashSet<&str>,
    mappings: &HashSet<&str>,
) -> Result<()> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                // Intrinsics are single-key objects
                if let Some((key, inner)) = map.iter().next() {
                    match key.as_str() {
                        "Ref" => {
                            if let Value::String(target) = inner {
                                if !resources.contains(target.as_str())
                                    && !parameters.contains(target.as_str())
                                    && !PSEUDO_PARAMETERS.contains(&target.as_str())
                                {
                                    return Err(Error::reference(format!(
                                        "{owner} refers to undeclared logical id {target}"
                                    )));
                                }
                            }
                            return Ok(());
                        }
                        "Fn::GetAtt" => {
                            let target = match inner {
                                Value::Array(parts) => parts.first().and_then(Value::as_str),
                                Value::String(dotted) => dotted.split('.').next(),
                                _ => None,
                            };
                            if let Some(target) = target {
                                if !resources.contains(target) {
                                    return Err(Error::reference(format!(
                                        "{owner} reads an attribute of undeclared resource {target}"
                                    )));
                                }
                            }
                            return Ok(());
                        }
                        "Fn::FindInMap" => {
                            if let Value::Array(parts) = inner {
                                if let Some(Value::String(mapping)) = parts.first() {
                                    if !mappings.contains(mapping.as_str()) {
                                        return Err(Error::reference(format!(
                                            "{owner} looks up undeclared mapping {mapping}"
                                        )));
                                    }
                                }
                                for part in parts.iter().skip(1) {
                                    check_value(owner, part, resources, parameters, mappings)?;
                                }
                            }
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
            for inner in map.values() {
                check_value(owner, inner, resources, parameters, mappings)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_value(owner, item, resources, parameters, mappings)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
