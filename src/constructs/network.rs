//! VPC layout, subnet allocation and security groups.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{InfraError, Result};
use crate::template::{Expr, Resource, Stack, Tagging};

/// Subnet flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    /// Routed through the internet gateway
    Public,
    /// Egress through a NAT gateway in a public subnet
    PrivateWithNat,
}

/// One subnet tier, repeated in every availability zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetTier {
    pub name: String,
    pub kind: SubnetKind,
    pub cidr_mask: u8,
}

/// Network layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub cidr: String,
    pub max_azs: usize,
    pub nat_gateways: usize,
    pub tiers: Vec<SubnetTier>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: "172.31.0.0/16".to_string(),
            max_azs: 2,
            nat_gateways: 1,
            tiers: vec![
                SubnetTier {
                    name: "public".to_string(),
                    kind: SubnetKind::Public,
                    cidr_mask: 20,
                },
                SubnetTier {
                    name: "application".to_string(),
                    kind: SubnetKind::PrivateWithNat,
                    cidr_mask: 20,
                },
            ],
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let cidr: Ipv4Cidr = self.cidr.parse()?;
        if self.max_azs == 0 {
            return Err(InfraError::Network("max_azs must be at least 1".to_string()));
        }
        if self.tiers.is_empty() {
            return Err(InfraError::Network("at least one subnet tier is required".to_string()));
        }
        let has_public = self.tiers.iter().any(|t| t.kind == SubnetKind::Public);
        let has_private = self.tiers.iter().any(|t| t.kind == SubnetKind::PrivateWithNat);
        if has_private && self.nat_gateways == 0 {
            return Err(InfraError::Network(
                "private_with_nat subnets need at least one NAT gateway".to_string(),
            ));
        }
        if self.nat_gateways > 0 && !has_public {
            return Err(InfraError::Network("NAT gateways need a public subnet tier".to_string()));
        }
        if self.nat_gateways > self.max_azs {
            return Err(InfraError::Network(format!(
                "{} NAT gateways requested but only {} availability zones",
                self.nat_gateways, self.max_azs
            )));
        }
        cidr.allocate(&self.tiers, self.max_azs)?;
        Ok(())
    }
}

/// An IPv4 block in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    base: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(InfraError::Network(format!("prefix /{} is longer than 32 bits", prefix)));
        }
        let base = u32::from(addr);
        if base & !mask(prefix) != 0 {
            return Err(InfraError::Network(format!(
                "{}/{} has host bits set",
                addr, prefix
            )));
        }
        Ok(Self { base, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    /// Carve one block per tier per AZ, tier by tier, in address order.
    pub fn allocate(&self, tiers: &[SubnetTier], azs: usize) -> Result<Vec<Ipv4Cidr>> {
        let end = self.base as u64 + self.size();
        let mut cursor = self.base as u64;
        let mut blocks = Vec::with_capacity(tiers.len() * azs);

        for tier in tiers {
            if tier.cidr_mask < self.prefix || tier.cidr_mask > 28 {
                return Err(InfraError::Network(format!(
                    "tier '{}' mask /{} does not fit inside {}",
                    tier.name, tier.cidr_mask, self
                )));
            }
            let block = 1u64 << (32 - tier.cidr_mask);
            for _ in 0..azs {
                cursor = cursor.div_ceil(block) * block;
                if cursor + block > end {
                    return Err(InfraError::Network(format!(
                        "{} is too small for {} /{} subnets of tier '{}'",
                        self, azs, tier.cidr_mask, tier.name
                    )));
                }
                blocks.push(Ipv4Cidr {
                    base: cursor as u32,
                    prefix: tier.cidr_mask,
                });
                cursor += block;
            }
        }
        Ok(blocks)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

impl FromStr for Ipv4Cidr {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| InfraError::Network(format!("'{}' is not in a.b.c.d/n form", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| InfraError::Network(format!("'{}' is not an IPv4 address", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| InfraError::Network(format!("'{}' is not a prefix length", prefix)))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

/// A VPC known by value
#[derive(Debug, Clone, PartialEq)]
pub struct VpcRef {
    pub vpc_id: Expr,
    pub public_subnets: Vec<Expr>,
    pub private_subnets: Vec<Expr>,
}

impl VpcRef {
    /// Export the VPC and its subnets as `<prefix>-vpc-id`,
    /// `<prefix>-public-subnet-<n>` and `<prefix>-private-subnet-<n>`,
    /// returning the importing view.
    pub fn export(&self, stack: &mut Stack, prefix: &str) -> Result<VpcRef> {
        let vpc_id = stack.export("VpcId", self.vpc_id.clone(), format!("{}-vpc-id", prefix))?;
        let mut public_subnets = Vec::new();
        for (i, subnet) in self.public_subnets.iter().enumerate() {
            let n = i + 1;
            public_subnets.push(stack.export(
                &format!("PublicSubnet{}", n),
                subnet.clone(),
                format!("{}-public-subnet-{}", prefix, n),
            )?);
        }
        let mut private_subnets = Vec::new();
        for (i, subnet) in self.private_subnets.iter().enumerate() {
            let n = i + 1;
            private_subnets.push(stack.export(
                &format!("PrivateSubnet{}", n),
                subnet.clone(),
                format!("{}-private-subnet-{}", prefix, n),
            )?);
        }
        Ok(VpcRef {
            vpc_id,
            public_subnets,
            private_subnets,
        })
    }

    /// Subnets for workloads: private when there are any, public otherwise
    pub fn workload_subnets(&self) -> &[Expr] {
        if self.private_subnets.is_empty() {
            &self.public_subnets
        } else {
            &self.private_subnets
        }
    }
}

fn pascal(name: &str) -> String {
    let cleaned = crate::template::logical_id(name);
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Emit a VPC with an internet gateway, one subnet per tier per AZ and the
/// configured NAT gateways.
pub fn build_vpc(stack: &mut Stack, id: &str, config: &NetworkConfig) -> Result<VpcRef> {
    config.validate()?;
    let cidr: Ipv4Cidr = config.cidr.parse()?;
    let blocks = cidr.allocate(&config.tiers, config.max_azs)?;
    log::info!(
        "{}: VPC {} with {} subnets across {} AZs",
        stack.name(),
        cidr,
        blocks.len(),
        config.max_azs
    );

    let vpc = stack.add(
        id,
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": cidr.to_string(),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": [{"Key": "Name", "Value": format!("{}/{}", stack.name(), id)}],
            }),
        )
        .taggable(Tagging::List),
    )?;
    let vpc_id = Expr::reference(&vpc);

    let igw = stack.add(
        &format!("{}Igw", vpc),
        Resource::new("AWS::EC2::InternetGateway", json!({})).taggable(Tagging::List),
    )?;
    let attachment = stack.add(
        &format!("{}IgwAttachment", vpc),
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({ "VpcId": vpc_id, "InternetGatewayId": Expr::reference(&igw) }),
        ),
    )?;

    let mut public_subnets = Vec::new();
    let mut private_subnets = Vec::new();
    let mut nat_gateways = Vec::new();
    let mut blocks = blocks.into_iter();

    // Public tiers first so NAT gateways exist before private routes need them.
    let ordered: Vec<(usize, &SubnetTier)> = config
        .tiers
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == SubnetKind::Public)
        .chain(config.tiers.iter().enumerate().filter(|(_, t)| t.kind == SubnetKind::PrivateWithNat))
        .collect();
    let mut tier_blocks: Vec<Vec<Ipv4Cidr>> = config
        .tiers
        .iter()
        .map(|_| blocks.by_ref().take(config.max_azs).collect())
        .collect();

    for (index, tier) in ordered {
        let tier_name = pascal(&tier.name);
        for (az, block) in std::mem::take(&mut tier_blocks[index]).into_iter().enumerate() {
            let prefix = format!("{}{}Subnet{}", vpc, tier_name, az + 1);
            let public = tier.kind == SubnetKind::Public;
            let subnet_type = if public { "Public" } else { "Private" };
            let subnet = stack.add(
                &prefix,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": vpc_id,
                        "CidrBlock": block.to_string(),
                        "AvailabilityZone": Expr::availability_zone(az),
                        "MapPublicIpOnLaunch": public,
                        "Tags": [
                            {"Key": "Name", "Value": format!("{}/{}", stack.name(), prefix)},
                            {"Key": "subnet-type", "Value": subnet_type},
                        ],
                    }),
                )
                .taggable(Tagging::List),
            )?;
            let route_table = stack.add(
                &format!("{}RouteTable", prefix),
                Resource::new("AWS::EC2::RouteTable", json!({ "VpcId": vpc_id })).taggable(Tagging::List),
            )?;
            stack.add(
                &format!("{}RouteTableAssociation", prefix),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": Expr::reference(&route_table),
                        "SubnetId": Expr::reference(&subnet),
                    }),
                ),
            )?;

            if public {
                stack.add(
                    &format!("{}DefaultRoute", prefix),
                    Resource::new(
                        "AWS::EC2::Route",
                        json!({
                            "RouteTableId": Expr::reference(&route_table),
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "GatewayId": Expr::reference(&igw),
                        }),
                    )
                    .depends_on(attachment.clone()),
                )?;
                if nat_gateways.len() < config.nat_gateways {
                    let eip = stack.add(
                        &format!("{}Eip", prefix),
                        Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" })).taggable(Tagging::List),
                    )?;
                    let nat = stack.add(
                        &format!("{}NatGateway", prefix),
                        Resource::new(
                            "AWS::EC2::NatGateway",
                            json!({
                                "SubnetId": Expr::reference(&subnet),
                                "AllocationId": Expr::get_att(&eip, "AllocationId"),
                            }),
                        )
                        .taggable(Tagging::List)
                        .depends_on(attachment.clone()),
                    )?;
                    nat_gateways.push(nat);
                }
                public_subnets.push(Expr::reference(&subnet));
            } else {
                let nat = &nat_gateways[az % nat_gateways.len()];
                stack.add(
                    &format!("{}DefaultRoute", prefix),
                    Resource::new(
                        "AWS::EC2::Route",
                        json!({
                            "RouteTableId": Expr::reference(&route_table),
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "NatGatewayId": Expr::reference(nat),
                        }),
                    ),
                )?;
                private_subnets.push(Expr::reference(&subnet));
            }
        }
    }

    Ok(VpcRef {
        vpc_id,
        public_subnets,
        private_subnets,
    })
}

/// One inbound rule
#[derive(Debug, Clone, PartialEq)]
pub struct IngressRule {
    pub peer: Peer,
    pub port: u16,
    pub description: String,
}

/// Where inbound traffic comes from
#[derive(Debug, Clone, PartialEq)]
pub enum Peer {
    AnyIpv4,
    Cidr(String),
    SecurityGroup(Expr),
}

impl IngressRule {
    pub fn tcp(peer: Peer, port: u16, description: impl Into<String>) -> Self {
        Self {
            peer,
            port,
            description: description.into(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        let mut rule = json!({
            "IpProtocol": "tcp",
            "FromPort": self.port,
            "ToPort": self.port,
            "Description": self.description,
        });
        match &self.peer {
            Peer::AnyIpv4 => rule["CidrIp"] = json!("0.0.0.0/0"),
            Peer::Cidr(cidr) => rule["CidrIp"] = json!(cidr),
            Peer::SecurityGroup(group) => rule["SourceSecurityGroupId"] = group.to_json(),
        }
        rule
    }
}

/// A security group known by value
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroupRef {
    pub logical_id: String,
    pub group_id: Expr,
}

/// Emit a security group. Without `allow_all_outbound` a single
/// unreachable egress rule replaces the implicit allow-all.
pub fn security_group(
    stack: &mut Stack,
    id: &str,
    vpc: &VpcRef,
    description: &str,
    allow_all_outbound: bool,
    ingress: &[IngressRule],
) -> Result<SecurityGroupRef> {
    let egress = if allow_all_outbound {
        json!([{"CidrIp": "0.0.0.0/0", "IpProtocol": "-1", "Description": "Allow all outbound traffic by default"}])
    } else {
        json!([{
            "CidrIp": "255.255.255.255/32",
            "IpProtocol": "icmp",
            "FromPort": 252,
            "ToPort": 86,
            "Description": "Disallow all traffic",
        }])
    };
    let mut properties = json!({
        "GroupDescription": description,
        "VpcId": vpc.vpc_id,
        "SecurityGroupEgress": egress,
    });
    if !ingress.is_empty() {
        properties["SecurityGroupIngress"] = json!(ingress.iter().map(IngressRule::to_json).collect::<Vec<_>>());
    }
    let logical = stack.add(
        id,
        Resource::new("AWS::EC2::SecurityGroup", properties).taggable(Tagging::List),
    )?;
    Ok(SecurityGroupRef {
        group_id: Expr::get_att(&logical, "GroupId"),
        logical_id: logical,
    })
}

/// Standalone ingress rule from one group to another
pub fn allow_from(
    stack: &mut Stack,
    id: &str,
    target: &SecurityGroupRef,
    source: &SecurityGroupRef,
    port: u16,
    description: &str,
) -> Result<String> {
    stack.add(
        id,
        Resource::new(
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": target.group_id,
                "SourceSecurityGroupId": source.group_id,
                "IpProtocol": "tcp",
                "FromPort": port,
                "ToPort": port,
                "Description": description,
            }),
        ),
    )
}
