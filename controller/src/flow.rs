//! Flow Rule Compiler
//!
//! Turns one leg of a channel into the four OpenFlow rules that carry it on
//! that leg's switch:
//!
//! | # | direction | ethertype | match                                  | actions              |
//! |---|-----------|-----------|----------------------------------------|----------------------|
//! | 1 | forward   | IPv4      | in=inport, vlan=A, src=A, dst=B        | retag to B, out=out  |
//! | 2 | forward   | ARP       | in=inport, vlan=A, spa=A, tpa=B        | retag to B, out=out  |
//! | 3 | reverse   | IPv4      | in=outport, vlan=A, src=B, dst=A       | out=inport           |
//! | 4 | reverse   | ARP       | in=outport, vlan=A, spa=B, tpa=A       | out=inport           |
//!
//! Retagging is applied on the forward direction only, and only when the two
//! endpoints sit on different VLANs.

use crate::model::PortNo;
use ipnetwork::Ipv4Network;
use std::fmt;

/// Priority of every channel rule
pub const CHANNEL_PRIORITY: u16 = 1000;
/// OFPVID_PRESENT bit of the `vlan_vid` field
pub const OFPVID_PRESENT: u16 = 0x1000;
/// 802.1Q TPID
pub const ETH_TYPE_VLAN: u16 = 0x8100;
/// IPv4 ethertype
pub const ETH_TYPE_IPV4: u16 = 0x0800;
/// ARP ethertype
pub const ETH_TYPE_ARP: u16 = 0x0806;

/// L3 family a rule matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ipv4,
    Arp,
}

impl Protocol {
    /// Ethertype matched
    pub fn eth_type(self) -> u16 {
        match self {
            Protocol::Ipv4 => ETH_TYPE_IPV4,
            Protocol::Arp => ETH_TYPE_ARP,
        }
    }
}

/// Match fields of a channel rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: PortNo,
    /// Present only for tagged endpoints
    pub vlan: Option<u16>,
    pub protocol: Protocol,
    /// `ipv4_src` or `arp_spa`
    pub src: Ipv4Network,
    /// `ipv4_dst` or `arp_tpa`
    pub dst: Ipv4Network,
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in_port={}", self.in_port)?;
        if let Some(vlan) = self.vlan {
            write!(f, ",dl_vlan={}", vlan)?;
        }
        match self.protocol {
            Protocol::Ipv4 => write!(f, ",ip,nw_src={},nw_dst={}", self.src, self.dst),
            Protocol::Arp => write!(f, ",arp,arp_spa={},arp_tpa={}", self.src, self.dst),
        }
    }
}

/// Action applied by a channel rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    PopVlan,
    PushVlan(u16),
    /// Raw `vlan_vid` value, OFPVID_PRESENT included
    SetVlanVid(u16),
    Output(PortNo),
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::PopVlan => f.write_str("pop_vlan"),
            FlowAction::PushVlan(tpid) => write!(f, "push_vlan:{:#06x}", tpid),
            FlowAction::SetVlanVid(vid) => write!(f, "set_field:{}->vlan_vid", vid),
            FlowAction::Output(port) => write!(f, "output:{}", port),
        }
    }
}

/// Abstract flow-table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub priority: u16,
    pub matches: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl FlowRule {
    /// ovs-ofctl match spec, as used by strict deletes
    pub fn match_spec(&self) -> String {
        format!("priority={},{}", self.priority, self.matches)
    }

    /// ovs-ofctl flow spec with actions, as used by adds
    pub fn flow_spec(&self) -> String {
        let actions: Vec<String> = self.actions.iter().map(|a| a.to_string()).collect();
        format!("{},actions={}", self.match_spec(), actions.join(","))
    }
}

/// Whether a rule is being installed or removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCommand {
    /// OFPFC_ADD; overwrites an identical match
    Add,
    /// OFPFC_DELETE_STRICT; exact match + priority
    DeleteStrict,
}

impl fmt::Display for FlowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowCommand::Add => f.write_str("add"),
            FlowCommand::DeleteStrict => f.write_str("delete"),
        }
    }
}

/// A rule plus what to do with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowCommand,
    pub rule: FlowRule,
}

/// Addressing of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    pub subnet: Ipv4Network,
    /// 0 = untagged
    pub vlan: u16,
}

/// Fully resolved leg: the near endpoint's ports plus both addressings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegSpec {
    /// Host-facing port of the near endpoint's role
    pub inport: PortNo,
    /// Egress port of the bound SLA
    pub outport: PortNo,
    pub local: Addressing,
    pub remote: Addressing,
}

/// Compile one leg into forward-IP, forward-ARP, reverse-IP, reverse-ARP.
pub fn compile(leg: &LegSpec, command: FlowCommand) -> Vec<FlowMod> {
    let vlan = (leg.local.vlan > 0).then_some(leg.local.vlan);
    let forward = forward_actions(leg);
    let reverse = vec![FlowAction::Output(leg.inport.clone())];

    let rule = |in_port: &PortNo,
                protocol: Protocol,
                src: Ipv4Network,
                dst: Ipv4Network,
                actions: &Vec<FlowAction>| FlowMod {
        command,
        rule: FlowRule {
            priority: CHANNEL_PRIORITY,
            matches: FlowMatch {
                in_port: in_port.clone(),
                vlan,
                protocol,
                src,
                dst,
            },
            actions: actions.clone(),
        },
    };

    let (local, remote) = (leg.local.subnet, leg.remote.subnet);
    vec![
        rule(&leg.inport, Protocol::Ipv4, local, remote, &forward),
        rule(&leg.inport, Protocol::Arp, local, remote, &forward),
        rule(&leg.outport, Protocol::Ipv4, remote, local, &reverse),
        rule(&leg.outport, Protocol::Arp, remote, local, &reverse),
    ]
}

fn forward_actions(leg: &LegSpec) -> Vec<FlowAction> {
    let output = FlowAction::Output(leg.outport.clone());
    if leg.local.vlan == leg.remote.vlan {
        // Same tag (or none) on both sides: nothing to rewrite
        vec![output]
    } else if leg.remote.vlan > 0 {
        vec![
            FlowAction::PopVlan,
            FlowAction::PushVlan(ETH_TYPE_VLAN),
            FlowAction::SetVlanVid(OFPVID_PRESENT + leg.remote.vlan),
            output,
        ]
    } else {
        vec![FlowAction::SetVlanVid(OFPVID_PRESENT + leg.remote.vlan), output]
    }
}
