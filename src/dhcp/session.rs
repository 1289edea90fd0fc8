use super::message::DhcpPacket;
use crate::addr::MacAddress;
use chrono::{DateTime, Utc};
use std::{fmt, net::Ipv4Addr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhcpSessionState {
    New,
    Discovered,
    Requested,
    Bound,
    Declined,
    Released,
    Informed,
}

impl DhcpSessionState {
    /// Moves allowed while the client keeps the same transaction id.
    fn continues_to(self, next: DhcpSessionState) -> bool {
        use DhcpSessionState::*;
        matches!(
            (self, next),
            (Discovered, Requested)
                | (Requested, Bound)
                | (Requested, Declined)
                | (Bound, Declined)
                | (Bound, Released)
        )
    }
}

/// Negotiation phase, tracked apart from the lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// No message accepted yet.
    Initial,
    /// A negotiation is under way.
    Pending,
    /// The last negotiation reached an end (ack, decline, release, inform).
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhcpMessageProcessed {
    Success,
    /// Retransmission of a message already applied.
    Duplicate,
    /// Out of order for the session's current state.
    Ignored,
    Failed,
    /// Message type this tracker does not handle.
    Unknown,
}

impl fmt::Display for DhcpMessageProcessed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The last transition applied to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpSessionResult {
    pub session_id: u32,
    pub current_state: DhcpSessionState,
    /// State the session was in when this transaction id first appeared.
    pub start_state: DhcpSessionState,
}

impl DhcpSessionResult {
    /// True when `session_id` is the recorded transaction and the session
    /// already sits in the state the message would move it to.
    pub fn is_duplicate_request(&self, session_id: u32, target: DhcpSessionState) -> bool {
        self.session_id == session_id && self.current_state == target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Windows,
    Apple,
    Android,
    Linux,
    Embedded,
    Unknown,
}

impl DeviceType {
    /// Guesses the platform from a DHCP vendor class identifier (option 60).
    pub fn from_vendor_class(vendor_class: Option<&str>) -> Self {
        let Some(class) = vendor_class else {
            return Self::Unknown;
        };
        let class = class.to_ascii_lowercase();

        if class.starts_with("msft") {
            Self::Windows
        } else if class.starts_with("android") {
            Self::Android
        } else if class.contains("apple") || class.starts_with("darwin") {
            Self::Apple
        } else if class.starts_with("dhcpcd") || class.contains("linux") {
            Self::Linux
        } else if ["udhcp", "esp", "lwip", "espressif"]
            .iter()
            .any(|prefix| class.starts_with(prefix))
        {
            Self::Embedded
        } else {
            Self::Unknown
        }
    }
}

/// A device identified by a successful DHCP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub physical_address: MacAddress,
    /// May be back-filled from the ARP cache after the fact.
    pub ip_address: Option<Ipv4Addr>,
    pub device_type: DeviceType,
    pub host_name: Option<String>,
    pub vendor_class: Option<String>,
}

impl DiscoveredDevice {
    fn from_packet(packet: &DhcpPacket, ip_address: Option<Ipv4Addr>) -> Self {
        Self {
            physical_address: packet.physical_address(),
            ip_address,
            device_type: DeviceType::from_vendor_class(packet.vendor_class()),
            host_name: packet.host_name().map(str::to_string),
            vendor_class: packet.vendor_class().map(str::to_string),
        }
    }
}

/// Per-client negotiation state, keyed by hardware address.
#[derive(Debug, Clone)]
pub struct DhcpSession {
    physical_address: MacAddress,
    request_state: RequestState,
    state: DhcpSessionState,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    session_timeout: Duration,
    discovered_device: Option<DiscoveredDevice>,
    result: Option<DhcpSessionResult>,
}

impl DhcpSession {
    pub fn new(physical_address: MacAddress, session_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            physical_address,
            request_state: RequestState::Initial,
            state: DhcpSessionState::New,
            created: now,
            updated: now,
            session_timeout,
            discovered_device: None,
            result: None,
        }
    }

    pub fn physical_address(&self) -> MacAddress {
        self.physical_address
    }

    pub fn request_state(&self) -> RequestState {
        self.request_state
    }

    pub fn state(&self) -> DhcpSessionState {
        self.state
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn discovered_device(&self) -> Option<&DiscoveredDevice> {
        self.discovered_device.as_ref()
    }

    pub fn result(&self) -> Option<DhcpSessionResult> {
        self.result
    }

    /// Whether more than `timeout` has passed between the last update and
    /// `now`. Advisory only; nothing is removed here.
    pub fn has_expired_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now.signed_duration_since(self.updated) > timeout,
            Err(_) => false,
        }
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Utc::now(), self.session_timeout)
    }

    pub fn process_discover(&mut self, packet: &DhcpPacket) -> DhcpMessageProcessed {
        self.advance(packet, DhcpSessionState::Discovered, RequestState::Pending)
    }

    /// Records the client's request and the device it identifies.
    pub fn process_request(&mut self, packet: &DhcpPacket) -> DhcpMessageProcessed {
        let outcome = self.advance(packet, DhcpSessionState::Requested, RequestState::Pending);
        if outcome == DhcpMessageProcessed::Success {
            let ip_address = packet
                .requested_address()
                .or_else(|| assigned(packet.client_address()));
            self.discovered_device = Some(DiscoveredDevice::from_packet(packet, ip_address));
        }
        outcome
    }

    /// A decline must name the refused address in option 50.
    pub fn process_decline(&mut self, packet: &DhcpPacket) -> DhcpMessageProcessed {
        let Some(declined) = packet.requested_address() else {
            return DhcpMessageProcessed::Failed;
        };

        let outcome = self.advance(packet, DhcpSessionState::Declined, RequestState::Completed);
        if outcome == DhcpMessageProcessed::Success {
            if let Some(device) = &mut self.discovered_device {
                if device.ip_address == Some(declined) {
                    device.ip_address = None;
                }
            }
        }
        outcome
    }

    pub fn process_release(&mut self, packet: &DhcpPacket) -> DhcpMessageProcessed {
        self.advance(packet, DhcpSessionState::Released, RequestState::Completed)
    }

    pub fn process_inform(&mut self, packet: &DhcpPacket) -> DhcpMessageProcessed {
        let outcome = self.advance(packet, DhcpSessionState::Informed, RequestState::Completed);
        if outcome == DhcpMessageProcessed::Success {
            if let Some(ip_address) = assigned(packet.client_address()) {
                self.discovered_device = Some(DiscoveredDevice::from_packet(packet, Some(ip_address)));
            }
        }
        outcome
    }

    /// An ack seen on the wire completes the client's current request.
    pub fn process_ack(&mut self, packet: &DhcpPacket) -> DhcpMessageProcessed {
        let outcome = self.advance(packet, DhcpSessionState::Bound, RequestState::Completed);
        if outcome == DhcpMessageProcessed::Success {
            if let (Some(device), Some(ip_address)) =
                (&mut self.discovered_device, assigned(packet.your_address()))
            {
                device.ip_address = Some(ip_address);
            }
        }
        outcome
    }

    /// Fills in the device address resolved elsewhere (e.g. from ARP),
    /// unless the session already knows one.
    pub fn backfill_ip_address(&mut self, ip_address: Ipv4Addr) {
        if let Some(device) = &mut self.discovered_device {
            if device.ip_address.is_none() {
                device.ip_address = Some(ip_address);
            }
        }
    }

    fn advance(
        &mut self,
        packet: &DhcpPacket,
        target: DhcpSessionState,
        request_state: RequestState,
    ) -> DhcpMessageProcessed {
        let xid = packet.xid();

        let start_state = match self.result {
            Some(result) if result.is_duplicate_request(xid, target) => {
                return DhcpMessageProcessed::Duplicate;
            }
            Some(result) if result.session_id == xid => {
                if !self.state.continues_to(target) {
                    return DhcpMessageProcessed::Ignored;
                }
                result.start_state
            }
            // Only an ack has to answer a request we have seen.
            _ if target == DhcpSessionState::Bound => return DhcpMessageProcessed::Ignored,
            _ => self.state,
        };

        self.result = Some(DhcpSessionResult {
            session_id: xid,
            current_state: target,
            start_state,
        });
        self.state = target;
        self.request_state = request_state;
        self.updated = Utc::now();
        DhcpMessageProcessed::Success
    }
}

fn assigned(address: Ipv4Addr) -> Option<Ipv4Addr> {
    (!address.is_unspecified()).then_some(address)
}
