//! Live capture through a `pnet` datalink channel.

use pnet::datalink::{self, Channel, DataLinkReceiver};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::Packet;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use super::CaptureSource;
use crate::error::CaptureError;
use crate::types::CaptureEvent;

/// How long a read may block before the reader re-checks for shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(250);

pub struct PnetCapture {
    interface: String,
    rx: Box<dyn DataLinkReceiver>,
    tcp_only: bool,
}

impl PnetCapture {
    /// Open a promiscuous Ethernet channel on `interface`.
    pub fn open(interface: &str, tcp_only: bool) -> Result<Self, CaptureError> {
        let nic = datalink::interfaces()
            .into_iter()
            .find(|nic| nic.name == interface)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface.to_string()))?;

        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            promiscuous: true,
            ..Default::default()
        };

        let rx = match datalink::channel(&nic, config) {
            // The sender half is never used
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => return Err(CaptureError::UnsupportedChannel(interface.to_string())),
            Err(source) => {
                return Err(CaptureError::Open {
                    interface: interface.to_string(),
                    source,
                })
            }
        };

        Ok(Self {
            interface: interface.to_string(),
            rx,
            tcp_only,
        })
    }

    /// Names of the interfaces the host exposes, for the not-found message.
    pub fn available_interfaces() -> Vec<String> {
        datalink::interfaces().into_iter().map(|nic| nic.name).collect()
    }
}

impl CaptureSource for PnetCapture {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn next_event(&mut self) -> Result<Option<CaptureEvent>, CaptureError> {
        match self.rx.next() {
            Ok(frame) => Ok(decode_frame(frame, self.tcp_only).map(|source| {
                let byte_size = u32::try_from(frame.len()).unwrap_or(u32::MAX);
                CaptureEvent::new(source, byte_size, Instant::now())
            })),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(source) => Err(CaptureError::Read {
                interface: self.interface.clone(),
                source,
            }),
        }
    }
}

/// Source address of an Ethernet frame carrying IPv4 or IPv6. With
/// `tcp_only`, frames whose transport is not TCP yield `None`.
pub fn decode_frame(frame: &[u8], tcp_only: bool) -> Option<IpAddr> {
    let ethernet = EthernetPacket::new(frame)?;

    let (source, is_tcp) = match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(ethernet.payload())?;
            (
                IpAddr::V4(ip.get_source()),
                ip.get_next_level_protocol() == IpNextHeaderProtocols::Tcp,
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(ethernet.payload())?;
            (
                IpAddr::V6(ip.get_source()),
                ip.get_next_header() == IpNextHeaderProtocols::Tcp,
            )
        }
        _ => return None,
    };

    if tcp_only && !is_tcp {
        return None;
    }
    Some(source)
}
