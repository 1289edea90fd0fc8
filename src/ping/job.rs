use crate::addr::{Ipv4Ext, Ipv4Subnet};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Identifies one sweep of a subnet and the probe currently in flight.
///
/// The encoded form travels as the ICMP echo payload so a reply can be
/// traced back to the probe that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingJob {
    pub job_id: Uuid,
    /// Increments once per probed address, starting at 1.
    pub task_id: u64,
    pub subnet: Ipv4Subnet,
    pub target: Ipv4Addr,
    pub timestamp: DateTime<Utc>,
}

impl PingJob {
    /// uuid + task id + target + network + prefix + timestamp
    pub const ENCODED_LEN: usize = 16 + 8 + 4 + 4 + 1 + 8;

    pub fn new(subnet: Ipv4Subnet) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            task_id: 0,
            subnet,
            target: subnet.network_address(),
            timestamp: Utc::now(),
        }
    }

    pub fn next_task(&mut self, target: Ipv4Addr) {
        self.task_id += 1;
        self.target = target;
        self.timestamp = Utc::now();
    }

    pub fn to_buffer(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_slice(self.job_id.as_bytes());
        buf.put_u64(self.task_id);
        buf.put_u32(self.target.to_u32());
        buf.put_u32(self.subnet.network_address().to_u32());
        buf.put_u8(self.subnet.prefix_len());
        buf.put_i64(self.timestamp.timestamp_millis());
        buf.freeze()
    }

    /// Decodes a payload produced by [`PingJob::to_buffer`]. Timestamps
    /// come back at millisecond precision.
    pub fn from_buffer(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }

        let mut job_id = [0u8; 16];
        buf.copy_to_slice(&mut job_id);
        let task_id = buf.get_u64();
        let target = Ipv4Addr::from(buf.get_u32());
        let network = Ipv4Addr::from(buf.get_u32());
        let prefix_len = buf.get_u8();
        let timestamp = DateTime::from_timestamp_millis(buf.get_i64())?;

        Some(Self {
            job_id: Uuid::from_bytes(job_id),
            task_id,
            subnet: Ipv4Subnet::with_prefix(network, prefix_len).ok()?,
            target,
            timestamp,
        })
    }
}
