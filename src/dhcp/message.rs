use crate::{addr::MacAddress, error::DiscoveryError};
use dhcproto::{
    v4::{self, DhcpOption, MessageType, Opcode, OptionCode},
    Decodable as _, Encodable as _,
};
use std::net::Ipv4Addr;

/// The fields of a DHCPv4 datagram the session tracker cares about.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    opcode: Opcode,
    message_type: Option<MessageType>,
    xid: u32,
    physical_address: MacAddress,
    client_address: Ipv4Addr,
    your_address: Ipv4Addr,
    requested_address: Option<Ipv4Addr>,
    host_name: Option<String>,
    vendor_class: Option<String>,
    client_id: Option<Vec<u8>>,
}

impl DhcpPacket {
    /// Decodes a datagram whose length lies in `[min_size, max_size]`.
    pub fn parse(data: &[u8], min_size: usize, max_size: usize) -> Result<Self, DiscoveryError> {
        if data.len() < min_size || data.len() > max_size {
            return Err(DiscoveryError::Protocol(format!(
                "datagram of {} bytes outside [{}, {}]",
                data.len(),
                min_size,
                max_size
            )));
        }
        Self::decode(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DiscoveryError> {
        let msg =
            v4::Message::from_bytes(data).map_err(|e| DiscoveryError::Protocol(e.to_string()))?;

        let message_type = msg.opts().get(OptionCode::MessageType).and_then(|opt| {
            if let DhcpOption::MessageType(kind) = opt {
                Some(*kind)
            } else {
                None
            }
        });

        let requested_address = msg
            .opts()
            .get(OptionCode::RequestedIpAddress)
            .and_then(|opt| {
                if let DhcpOption::RequestedIpAddress(ip) = opt {
                    Some(*ip)
                } else {
                    None
                }
            });

        let host_name = msg.opts().get(OptionCode::Hostname).and_then(|opt| {
            if let DhcpOption::Hostname(name) = opt {
                Some(name.clone())
            } else {
                None
            }
        });

        let vendor_class = msg
            .opts()
            .get(OptionCode::ClassIdentifier)
            .and_then(|opt| {
                if let DhcpOption::ClassIdentifier(class) = opt {
                    Some(String::from_utf8_lossy(class).into_owned())
                } else {
                    None
                }
            });

        let client_id = msg
            .opts()
            .get(OptionCode::ClientIdentifier)
            .and_then(|opt| {
                if let DhcpOption::ClientIdentifier(id) = opt {
                    Some(id.clone())
                } else {
                    None
                }
            });

        Ok(Self {
            opcode: msg.opcode(),
            message_type,
            xid: msg.xid(),
            physical_address: MacAddress::from_slice(msg.chaddr()).unwrap_or(MacAddress::NONE),
            client_address: msg.ciaddr(),
            your_address: msg.yiaddr(),
            requested_address,
            host_name,
            vendor_class,
            client_id,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Option 53, if present.
    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    /// Transaction id; identifies one negotiation of a client.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn physical_address(&self) -> MacAddress {
        self.physical_address
    }

    /// `ciaddr`
    pub fn client_address(&self) -> Ipv4Addr {
        self.client_address
    }

    /// `yiaddr`
    pub fn your_address(&self) -> Ipv4Addr {
        self.your_address
    }

    /// Option 50.
    pub fn requested_address(&self) -> Option<Ipv4Addr> {
        self.requested_address
    }

    /// Option 12.
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    /// Option 60.
    pub fn vendor_class(&self) -> Option<&str> {
        self.vendor_class.as_deref()
    }

    /// Option 61.
    pub fn client_id(&self) -> Option<&[u8]> {
        self.client_id.as_deref()
    }
}

/// Builds client-side DHCP datagrams, e.g. for exercising a listener.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    opcode: Opcode,
    message_type: MessageType,
    physical_address: MacAddress,
    xid: u32,
    client_address: Ipv4Addr,
    your_address: Ipv4Addr,
    requested_address: Option<Ipv4Addr>,
    host_name: Option<String>,
    vendor_class: Option<String>,
}

impl ClientMessage {
    pub fn new(message_type: MessageType, physical_address: MacAddress, xid: u32) -> Self {
        Self {
            opcode: Opcode::BootRequest,
            message_type,
            physical_address,
            xid,
            client_address: Ipv4Addr::UNSPECIFIED,
            your_address: Ipv4Addr::UNSPECIFIED,
            requested_address: None,
            host_name: None,
            vendor_class: None,
        }
    }

    pub fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn with_client_address(mut self, address: Ipv4Addr) -> Self {
        self.client_address = address;
        self
    }

    pub fn with_your_address(mut self, address: Ipv4Addr) -> Self {
        self.your_address = address;
        self
    }

    pub fn with_requested_address(mut self, address: Ipv4Addr) -> Self {
        self.requested_address = Some(address);
        self
    }

    pub fn with_host_name(mut self, name: impl Into<String>) -> Self {
        self.host_name = Some(name.into());
        self
    }

    pub fn with_vendor_class(mut self, class: impl Into<String>) -> Self {
        self.vendor_class = Some(class.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        let octets = self.physical_address.octets();

        let mut msg = v4::Message::default();
        msg.set_opcode(self.opcode)
            .set_htype(v4::HType::Eth)
            .set_chaddr(&octets)
            .set_xid(self.xid)
            .set_ciaddr(self.client_address)
            .set_yiaddr(self.your_address)
            .set_flags(v4::Flags::default().set_broadcast());

        msg.opts_mut()
            .insert(DhcpOption::MessageType(self.message_type));

        // Client identifier: htype Ethernet followed by the hardware address
        let mut client_id = vec![1u8];
        client_id.extend_from_slice(&octets);
        msg.opts_mut()
            .insert(DhcpOption::ClientIdentifier(client_id));

        if let Some(ip) = self.requested_address {
            msg.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
        }
        if let Some(name) = &self.host_name {
            msg.opts_mut().insert(DhcpOption::Hostname(name.clone()));
        }
        if let Some(class) = &self.vendor_class {
            msg.opts_mut()
                .insert(DhcpOption::ClassIdentifier(class.as_bytes().to_vec()));
        }

        msg.to_vec()
            .map_err(|e| DiscoveryError::Protocol(e.to_string()))
    }
}
