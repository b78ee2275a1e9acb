use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::RangeInclusive,
};

use log::debug;

use super::sa;

pub const IKE_HEADER_LENGTH: usize = 28;
const PAYLOAD_HEADER_LENGTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const IKE_SA_INIT: ExchangeType = ExchangeType(34);
    pub const IKE_AUTH: ExchangeType = ExchangeType(35);
    pub const CREATE_CHILD_SA: ExchangeType = ExchangeType(36);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(37);

    pub fn from_u8(value: u8) -> ExchangeType {
        ExchangeType(value)
    }

    fn is_known(&self) -> bool {
        self.0 >= Self::IKE_SA_INIT.0 && self.0 <= Self::INFORMATIONAL.0
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE_SA_INIT => write!(f, "IKE_SA_INIT"),
            Self::IKE_AUTH => write!(f, "IKE_AUTH"),
            Self::CREATE_CHILD_SA => write!(f, "CREATE_CHILD_SA"),
            Self::INFORMATIONAL => write!(f, "INFORMATIONAL"),
            _ => write!(f, "Unknown exchange type {}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flags(u8);

impl Flags {
    const INITIATOR: Flags = Flags(1 << 3);
    const RESPONSE: Flags = Flags(1 << 5);

    fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(33);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(34);
    pub const ID_INITIATOR: PayloadType = PayloadType(35);
    pub const ID_RESPONDER: PayloadType = PayloadType(36);
    pub const CERTIFICATE: PayloadType = PayloadType(37);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(38);
    pub const AUTHENTICATION: PayloadType = PayloadType(39);
    pub const NONCE: PayloadType = PayloadType(40);
    pub const NOTIFY: PayloadType = PayloadType(41);
    pub const DELETE: PayloadType = PayloadType(42);
    pub const VENDOR_ID: PayloadType = PayloadType(43);
    pub const TRAFFIC_SELECTOR_INITIATOR: PayloadType = PayloadType(44);
    pub const TRAFFIC_SELECTOR_RESPONDER: PayloadType = PayloadType(45);
    pub const ENCRYPTED_AND_AUTHENTICATED: PayloadType = PayloadType(46);
    pub const CONFIGURATION: PayloadType = PayloadType(47);
    pub const EXTENSIBLE_AUTHENTICATION: PayloadType = PayloadType(48);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }

    fn is_recognized(&self) -> bool {
        *self == Self::NONE
            || (self.0 >= Self::SECURITY_ASSOCIATION.0
                && self.0 <= Self::EXTENSIBLE_AUTHENTICATION.0)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload"),
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association"),
            Self::KEY_EXCHANGE => write!(f, "Key Exchange"),
            Self::ID_INITIATOR => write!(f, "Identification - Initiator"),
            Self::ID_RESPONDER => write!(f, "Identification - Responder"),
            Self::CERTIFICATE => write!(f, "Certificate"),
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request"),
            Self::AUTHENTICATION => write!(f, "Authentication"),
            Self::NONCE => write!(f, "Nonce"),
            Self::NOTIFY => write!(f, "Notify"),
            Self::DELETE => write!(f, "Delete"),
            Self::VENDOR_ID => write!(f, "Vendor ID"),
            Self::TRAFFIC_SELECTOR_INITIATOR => write!(f, "Traffic Selector - Initiator"),
            Self::TRAFFIC_SELECTOR_RESPONDER => write!(f, "Traffic Selector - Responder"),
            Self::ENCRYPTED_AND_AUTHENTICATED => write!(f, "Encrypted and Authenticated"),
            Self::CONFIGURATION => write!(f, "Configuration"),
            Self::EXTENSIBLE_AUTHENTICATION => write!(f, "Extensible Authentication"),
            _ => write!(f, "Unknown payload type {}", self.0),
        }
    }
}

/// IKE message header, RFC 7296, Section 3.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: PayloadType,
    pub major_version: u8,
    pub minor_version: u8,
    pub exchange_type: ExchangeType,
    pub is_response: bool,
    pub from_initiator: bool,
    pub message_id: u32,
    pub length: u32,
}

impl IkeHeader {
    /// Creates a header for an outbound message; the version is always 2.0.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        next_payload: PayloadType,
        exchange_type: ExchangeType,
        is_response: bool,
        from_initiator: bool,
        message_id: u32,
        length: u32,
    ) -> IkeHeader {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            major_version: 2,
            minor_version: 0,
            exchange_type,
            is_response,
            from_initiator,
            message_id,
            length,
        }
    }

    /// Decodes the fixed header from a full datagram.
    ///
    /// The datagram must be strictly longer than the header; a header
    /// without at least one payload octet cannot be a valid message.
    pub fn from_datagram(p: &[u8]) -> Result<IkeHeader, FormatError> {
        if p.len() <= IKE_HEADER_LENGTH {
            debug!("Not enough data in message ({} bytes)", p.len());
            return Err("Message is too short to contain a header".into());
        }
        let mut initiator_spi = [0u8; 8];
        initiator_spi.copy_from_slice(&p[0..8]);
        let mut responder_spi = [0u8; 8];
        responder_spi.copy_from_slice(&p[8..16]);
        let version = p[17];
        let flags = Flags(p[19]);
        let mut message_id = [0u8; 4];
        message_id.copy_from_slice(&p[20..24]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&p[24..28]);
        Ok(IkeHeader {
            initiator_spi: u64::from_be_bytes(initiator_spi),
            responder_spi: u64::from_be_bytes(responder_spi),
            next_payload: PayloadType::from_u8(p[16]),
            major_version: version >> 4,
            minor_version: version & 0x0f,
            exchange_type: ExchangeType::from_u8(p[18]),
            is_response: flags.has(Flags::RESPONSE),
            from_initiator: flags.has(Flags::INITIATOR),
            message_id: u32::from_be_bytes(message_id),
            length: u32::from_be_bytes(length),
        })
    }

    /// Validates version, exchange type and the declared length against the
    /// received packet length.
    pub fn check_valid(&self, packet_length: usize) -> Result<(), FormatError> {
        if self.major_version > 2 {
            // A higher version gets a dedicated error so the caller can
            // answer with an INVALID_MAJOR_VERSION notification.
            debug!(
                "Unsupported major version {}.{}",
                self.major_version, self.minor_version
            );
            return Err(FormatError::InvalidMajorVersion(self.major_version));
        }
        if self.major_version < 2 {
            debug!("Major version {} is smaller than 2", self.major_version);
            return Err("Major version is smaller than 2".into());
        }
        if !self.exchange_type.is_known() {
            debug!("Unsupported exchange type {}", self.exchange_type);
            return Err("Unsupported exchange type".into());
        }
        if self.length as usize != packet_length {
            debug!(
                "Message length mismatch (received {} bytes, header specifies {} bytes)",
                packet_length, self.length
            );
            return Err("Message length mismatch".into());
        }
        Ok(())
    }

    pub fn encode(&self, dest: &mut Vec<u8>) {
        dest.extend_from_slice(&self.initiator_spi.to_be_bytes());
        dest.extend_from_slice(&self.responder_spi.to_be_bytes());
        dest.push(self.next_payload.to_u8());
        dest.push(self.major_version << 4 | self.minor_version);
        dest.push(self.exchange_type.0);
        let mut flags = 0u8;
        if self.is_response {
            flags |= Flags::RESPONSE.0;
        }
        if self.from_initiator {
            flags |= Flags::INITIATOR.0;
        }
        dest.push(flags);
        dest.extend_from_slice(&self.message_id.to_be_bytes());
        dest.extend_from_slice(&self.length.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    critical: bool,
    body: PayloadBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadBody {
    SecurityAssociation(Vec<sa::Proposal>),
    KeyExchange(PayloadKeyExchange),
    Nonce(Vec<u8>),
    Notify(PayloadNotify),
    TrafficSelectorInitiator(Vec<TrafficSelector>),
    TrafficSelectorResponder(Vec<TrafficSelector>),
    // Recognized payloads without a structured decoder, and unrecognized
    // non-critical payloads; kept verbatim so later processing can inspect
    // or re-encode them instead of losing data.
    Opaque {
        payload_type: PayloadType,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn new(critical: bool, body: PayloadBody) -> Payload {
        Payload { critical, body }
    }

    pub fn critical(&self) -> bool {
        self.critical
    }

    pub fn body(&self) -> &PayloadBody {
        &self.body
    }

    pub fn payload_type(&self) -> PayloadType {
        match self.body {
            PayloadBody::SecurityAssociation(_) => PayloadType::SECURITY_ASSOCIATION,
            PayloadBody::KeyExchange(_) => PayloadType::KEY_EXCHANGE,
            PayloadBody::Nonce(_) => PayloadType::NONCE,
            PayloadBody::Notify(_) => PayloadType::NOTIFY,
            PayloadBody::TrafficSelectorInitiator(_) => PayloadType::TRAFFIC_SELECTOR_INITIATOR,
            PayloadBody::TrafficSelectorResponder(_) => PayloadType::TRAFFIC_SELECTOR_RESPONDER,
            PayloadBody::Opaque { payload_type, .. } => payload_type,
        }
    }

    fn body_length(&self) -> usize {
        match self.body {
            PayloadBody::SecurityAssociation(ref proposals) => {
                sa::encoded_proposals_length(proposals)
            }
            PayloadBody::KeyExchange(ref kex) => 4 + kex.data.len(),
            PayloadBody::Nonce(ref data) => data.len(),
            PayloadBody::Notify(ref notify) => 4 + notify.spi.len() + notify.data.len(),
            PayloadBody::TrafficSelectorInitiator(ref selectors)
            | PayloadBody::TrafficSelectorResponder(ref selectors) => {
                4 + selectors
                    .iter()
                    .map(|selector| selector.encoded_length())
                    .sum::<usize>()
            }
            PayloadBody::Opaque { ref data, .. } => data.len(),
        }
    }

    fn encoded_length(&self) -> usize {
        PAYLOAD_HEADER_LENGTH + self.body_length()
    }

    fn encode(&self, next_payload: PayloadType, dest: &mut Vec<u8>) {
        dest.push(next_payload.to_u8());
        dest.push(if self.critical { 1 << 7 } else { 0 });
        dest.extend_from_slice(&(self.encoded_length() as u16).to_be_bytes());
        match self.body {
            PayloadBody::SecurityAssociation(ref proposals) => {
                sa::encode_proposals(proposals, dest)
            }
            PayloadBody::KeyExchange(ref kex) => {
                dest.extend_from_slice(&kex.dh_group.to_be_bytes());
                dest.extend_from_slice(&[0u8, 0u8]);
                dest.extend_from_slice(&kex.data);
            }
            PayloadBody::Nonce(ref data) => dest.extend_from_slice(data),
            PayloadBody::Notify(ref notify) => {
                dest.push(notify.protocol_id.map(|id| id.to_u8()).unwrap_or(0));
                dest.push(notify.spi.len() as u8);
                dest.extend_from_slice(&notify.message_type.to_u16().to_be_bytes());
                dest.extend_from_slice(&notify.spi);
                dest.extend_from_slice(&notify.data);
            }
            PayloadBody::TrafficSelectorInitiator(ref selectors)
            | PayloadBody::TrafficSelectorResponder(ref selectors) => {
                dest.push(selectors.len() as u8);
                dest.extend_from_slice(&[0u8, 0u8, 0u8]);
                for selector in selectors {
                    selector.write_to(dest);
                }
            }
            PayloadBody::Opaque { ref data, .. } => dest.extend_from_slice(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadKeyExchange {
    pub dh_group: u16,
    pub data: Vec<u8>,
}

impl PayloadKeyExchange {
    fn from_body(data: &[u8]) -> Result<PayloadKeyExchange, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in key exchange payload");
            return Err("Not enough data in key exchange payload".into());
        }
        let mut dh_group = [0u8; 2];
        dh_group.copy_from_slice(&data[0..2]);
        Ok(PayloadKeyExchange {
            dh_group: u16::from_be_bytes(dh_group),
            data: data[4..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyMessageType(u16);

impl NotifyMessageType {
    pub const UNSUPPORTED_CRITICAL_PAYLOAD: NotifyMessageType = NotifyMessageType(1);
    pub const INVALID_MAJOR_VERSION: NotifyMessageType = NotifyMessageType(5);
    pub const INVALID_SYNTAX: NotifyMessageType = NotifyMessageType(7);
    pub const NO_PROPOSAL_CHOSEN: NotifyMessageType = NotifyMessageType(14);
    pub const INVALID_KE_PAYLOAD: NotifyMessageType = NotifyMessageType(17);
    pub const AUTHENTICATION_FAILED: NotifyMessageType = NotifyMessageType(24);
    pub const INITIAL_CONTACT: NotifyMessageType = NotifyMessageType(16384);
    pub const NAT_DETECTION_SOURCE_IP: NotifyMessageType = NotifyMessageType(16388);
    pub const NAT_DETECTION_DESTINATION_IP: NotifyMessageType = NotifyMessageType(16389);
    pub const COOKIE: NotifyMessageType = NotifyMessageType(16390);
    pub const REKEY_SA: NotifyMessageType = NotifyMessageType(16393);
    pub const IKEV2_FRAGMENTATION_SUPPORTED: NotifyMessageType = NotifyMessageType(16430);

    pub fn from_u16(value: u16) -> NotifyMessageType {
        NotifyMessageType(value)
    }

    pub fn to_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NotifyMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSUPPORTED_CRITICAL_PAYLOAD => write!(f, "UNSUPPORTED_CRITICAL_PAYLOAD"),
            Self::INVALID_MAJOR_VERSION => write!(f, "INVALID_MAJOR_VERSION"),
            Self::INVALID_SYNTAX => write!(f, "INVALID_SYNTAX"),
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO_PROPOSAL_CHOSEN"),
            Self::INVALID_KE_PAYLOAD => write!(f, "INVALID_KE_PAYLOAD"),
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION_FAILED"),
            Self::INITIAL_CONTACT => write!(f, "INITIAL_CONTACT"),
            Self::NAT_DETECTION_SOURCE_IP => write!(f, "NAT_DETECTION_SOURCE_IP"),
            Self::NAT_DETECTION_DESTINATION_IP => write!(f, "NAT_DETECTION_DESTINATION_IP"),
            Self::COOKIE => write!(f, "COOKIE"),
            Self::REKEY_SA => write!(f, "REKEY_SA"),
            Self::IKEV2_FRAGMENTATION_SUPPORTED => write!(f, "IKEV2_FRAGMENTATION_SUPPORTED"),
            _ => write!(f, "Unknown notify message type {}", self.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadNotify {
    pub protocol_id: Option<sa::ProtocolId>,
    pub spi: Vec<u8>,
    pub message_type: NotifyMessageType,
    pub data: Vec<u8>,
}

impl PayloadNotify {
    fn from_body(data: &[u8]) -> Result<PayloadNotify, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in notify payload");
            return Err("Not enough data in notify payload".into());
        }
        let protocol_id = if data[0] != 0 {
            Some(sa::ProtocolId::from_u8(data[0])?)
        } else {
            None
        };
        let spi_size = data[1] as usize;
        if data.len() < 4 + spi_size {
            debug!("Notify SPI overflow");
            return Err("Notify SPI overflow".into());
        }
        let mut message_type = [0u8; 2];
        message_type.copy_from_slice(&data[2..4]);
        Ok(PayloadNotify {
            protocol_id,
            spi: data[4..4 + spi_size].to_vec(),
            message_type: NotifyMessageType::from_u16(u16::from_be_bytes(message_type)),
            data: data[4 + spi_size..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSelectorType(u8);

impl TrafficSelectorType {
    pub const TS_IPV4_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(7);
    pub const TS_IPV6_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(8);

    fn addr_length(&self) -> usize {
        match *self {
            Self::TS_IPV4_ADDR_RANGE => 4,
            _ => 16,
        }
    }
}

impl fmt::Display for TrafficSelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TS_IPV4_ADDR_RANGE => write!(f, "TS_IPV4_ADDR_RANGE"),
            Self::TS_IPV6_ADDR_RANGE => write!(f, "TS_IPV6_ADDR_RANGE"),
            _ => write!(f, "Unknown traffic selector type {}", self.0),
        }
    }
}

/// Traffic selector, RFC 7296, Section 3.13.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    ts_type: TrafficSelectorType,
    ip_protocol: u8,
    port_range: RangeInclusive<u16>,
    addr_range: RangeInclusive<IpAddr>,
}

impl TrafficSelector {
    /// Creates a selector for an outbound payload; the selector type is
    /// derived from the address family.
    pub fn new(
        ip_protocol: u8,
        port_range: RangeInclusive<u16>,
        addr_range: RangeInclusive<IpAddr>,
    ) -> Result<TrafficSelector, FormatError> {
        let ts_type = match (addr_range.start(), addr_range.end()) {
            (IpAddr::V4(_), IpAddr::V4(_)) => TrafficSelectorType::TS_IPV4_ADDR_RANGE,
            (IpAddr::V6(_), IpAddr::V6(_)) => TrafficSelectorType::TS_IPV6_ADDR_RANGE,
            _ => return Err("Traffic selector address family mismatch".into()),
        };
        if port_range.start() > port_range.end() {
            return Err("Traffic selector port range is inverted".into());
        }
        Ok(TrafficSelector {
            ts_type,
            ip_protocol,
            port_range,
            addr_range,
        })
    }

    pub fn ts_type(&self) -> TrafficSelectorType {
        self.ts_type
    }

    pub fn ip_protocol(&self) -> u8 {
        self.ip_protocol
    }

    pub fn port_range(&self) -> &RangeInclusive<u16> {
        &self.port_range
    }

    pub fn addr_range(&self) -> &RangeInclusive<IpAddr> {
        &self.addr_range
    }

    fn read_from(data: &[u8]) -> Result<(TrafficSelector, usize), FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in traffic selector");
            return Err("Not enough data in traffic selector".into());
        }
        let ts_type = TrafficSelectorType(data[0]);
        let addr_length = match ts_type {
            TrafficSelectorType::TS_IPV4_ADDR_RANGE | TrafficSelectorType::TS_IPV6_ADDR_RANGE => {
                ts_type.addr_length()
            }
            _ => {
                debug!("Unsupported traffic selector type {}", ts_type);
                return Err("Unsupported traffic selector type".into());
            }
        };
        let mut selector_length = [0u8; 2];
        selector_length.copy_from_slice(&data[2..4]);
        let selector_length = u16::from_be_bytes(selector_length) as usize;
        if selector_length != 8 + 2 * addr_length || data.len() < selector_length {
            debug!("Traffic selector length mismatch");
            return Err("Traffic selector length mismatch".into());
        }
        let mut start_port = [0u8; 2];
        start_port.copy_from_slice(&data[4..6]);
        let start_port = u16::from_be_bytes(start_port);
        let mut end_port = [0u8; 2];
        end_port.copy_from_slice(&data[6..8]);
        let end_port = u16::from_be_bytes(end_port);
        if start_port > end_port {
            debug!("Traffic selector port range is inverted");
            return Err("Traffic selector port range is inverted".into());
        }
        let start_addr = &data[8..8 + addr_length];
        let end_addr = &data[8 + addr_length..selector_length];
        let addr_range = if ts_type == TrafficSelectorType::TS_IPV4_ADDR_RANGE {
            let mut start = [0u8; 4];
            start.copy_from_slice(start_addr);
            let mut end = [0u8; 4];
            end.copy_from_slice(end_addr);
            IpAddr::V4(Ipv4Addr::from(start))..=IpAddr::V4(Ipv4Addr::from(end))
        } else {
            let mut start = [0u8; 16];
            start.copy_from_slice(start_addr);
            let mut end = [0u8; 16];
            end.copy_from_slice(end_addr);
            IpAddr::V6(Ipv6Addr::from(start))..=IpAddr::V6(Ipv6Addr::from(end))
        };
        Ok((
            TrafficSelector {
                ts_type,
                ip_protocol: data[1],
                port_range: start_port..=end_port,
                addr_range,
            },
            selector_length,
        ))
    }

    fn write_to(&self, dest: &mut Vec<u8>) {
        dest.push(self.ts_type.0);
        dest.push(self.ip_protocol);
        dest.extend_from_slice(&(self.encoded_length() as u16).to_be_bytes());
        dest.extend_from_slice(&self.port_range.start().to_be_bytes());
        dest.extend_from_slice(&self.port_range.end().to_be_bytes());
        // Mixed address families are rejected at construction.
        match (*self.addr_range.start(), *self.addr_range.end()) {
            (IpAddr::V4(start_addr), IpAddr::V4(end_addr)) => {
                dest.extend_from_slice(&start_addr.octets());
                dest.extend_from_slice(&end_addr.octets());
            }
            (IpAddr::V6(start_addr), IpAddr::V6(end_addr)) => {
                dest.extend_from_slice(&start_addr.octets());
                dest.extend_from_slice(&end_addr.octets());
            }
            _ => {}
        }
    }

    fn encoded_length(&self) -> usize {
        8 + 2 * self.ts_type.addr_length()
    }
}

fn decode_traffic_selectors(data: &[u8]) -> Result<Vec<TrafficSelector>, FormatError> {
    if data.len() < 4 {
        debug!("Not enough data in traffic selector payload");
        return Err("Not enough data in traffic selector payload".into());
    }
    let num_selectors = data[0] as usize;
    if num_selectors == 0 {
        debug!("Traffic selector payload has no selectors");
        return Err("Traffic selector payload has no selectors".into());
    }
    let mut selectors = Vec::with_capacity(num_selectors);
    let mut remaining = &data[4..];
    for _ in 0..num_selectors {
        let (selector, consumed) = TrafficSelector::read_from(remaining)?;
        selectors.push(selector);
        remaining = &remaining[consumed..];
    }
    if !remaining.is_empty() {
        debug!("Traffic selector payload has unaccounted data");
        return Err("Traffic selector payload has unaccounted data".into());
    }
    Ok(selectors)
}

struct PayloadReader<'a> {
    is_response: bool,
    next_payload: PayloadType,
    data: &'a [u8],
}

impl PayloadReader<'_> {
    fn read_next(&mut self) -> Option<Result<Payload, FormatError>> {
        const CRITICAL_BIT: u8 = 1 << 7;
        if self.next_payload == PayloadType::NONE {
            if !self.data.is_empty() {
                debug!("Message has unaccounted data");
                return Some(Err("Message has unaccounted data".into()));
            }
            return None;
        }
        if self.data.len() < PAYLOAD_HEADER_LENGTH {
            debug!("Not enough data in payload header");
            return Some(Err("Not enough data in payload header".into()));
        }
        let payload_type = self.next_payload;
        let next_payload = PayloadType::from_u8(self.data[0]);
        let payload_flags = self.data[1];
        let mut payload_length = [0u8; 2];
        payload_length.copy_from_slice(&self.data[2..4]);
        let payload_length = u16::from_be_bytes(payload_length) as usize;
        let critical = match payload_flags {
            0x00 => false,
            CRITICAL_BIT => true,
            _ => {
                debug!(
                    "Payload {} has reserved flags set: {:02x}",
                    payload_type, payload_flags
                );
                return Some(Err("Payload reserved flags are set".into()));
            }
        };
        if payload_length < PAYLOAD_HEADER_LENGTH || self.data.len() < payload_length {
            debug!("Payload {} overflow", payload_type);
            return Some(Err("Payload length overflow".into()));
        }
        let body = &self.data[PAYLOAD_HEADER_LENGTH..payload_length];
        let decoded = decode_payload_body(self.is_response, payload_type, critical, body);
        self.next_payload = next_payload;
        self.data = &self.data[payload_length..];
        match decoded {
            Ok(body) => Some(Ok(Payload { critical, body })),
            Err(err) => Some(Err(err)),
        }
    }
}

// Dispatch from the current payload's type tag to its body decoder.
fn decode_payload_body(
    is_response: bool,
    payload_type: PayloadType,
    critical: bool,
    body: &[u8],
) -> Result<PayloadBody, FormatError> {
    if !payload_type.is_recognized() {
        if critical {
            debug!("Unsupported critical payload {}", payload_type);
            return Err(FormatError::UnsupportedCriticalPayload(
                payload_type.to_u8(),
            ));
        }
        debug!("Skipping unsupported payload {}", payload_type);
        return Ok(PayloadBody::Opaque {
            payload_type,
            data: body.to_vec(),
        });
    }
    match payload_type {
        PayloadType::SECURITY_ASSOCIATION => Ok(PayloadBody::SecurityAssociation(
            sa::decode_proposals(is_response, body)?,
        )),
        PayloadType::KEY_EXCHANGE => Ok(PayloadBody::KeyExchange(PayloadKeyExchange::from_body(
            body,
        )?)),
        PayloadType::NONCE => Ok(PayloadBody::Nonce(body.to_vec())),
        PayloadType::NOTIFY => Ok(PayloadBody::Notify(PayloadNotify::from_body(body)?)),
        PayloadType::TRAFFIC_SELECTOR_INITIATOR => Ok(PayloadBody::TrafficSelectorInitiator(
            decode_traffic_selectors(body)?,
        )),
        PayloadType::TRAFFIC_SELECTOR_RESPONDER => Ok(PayloadBody::TrafficSelectorResponder(
            decode_traffic_selectors(body)?,
        )),
        _ => Ok(PayloadBody::Opaque {
            payload_type,
            data: body.to_vec(),
        }),
    }
}

/// Decodes the payload chain that follows a validated header.
pub fn decode_payloads(header: &IkeHeader, data: &[u8]) -> Result<Vec<Payload>, FormatError> {
    let mut reader = PayloadReader {
        is_response: header.is_response,
        next_payload: header.next_payload,
        data,
    };
    let mut payloads = Vec::new();
    while let Some(payload) = reader.read_next() {
        payloads.push(payload?);
    }
    Ok(payloads)
}

/// A fully decoded IKE message: header plus its payload chain.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub header: IkeHeader,
    pub payloads: Vec<Payload>,
}

impl Message {
    /// Builds an outbound message, filling in the header's next-payload and
    /// length fields from the payload chain.
    pub fn new(mut header: IkeHeader, payloads: Vec<Payload>) -> Message {
        header.next_payload = payloads
            .first()
            .map(|payload| payload.payload_type())
            .unwrap_or(PayloadType::NONE);
        let payloads_length = payloads
            .iter()
            .map(|payload| payload.encoded_length())
            .sum::<usize>();
        header.length = (IKE_HEADER_LENGTH + payloads_length) as u32;
        Message { header, payloads }
    }

    /// Decodes and validates a full datagram.
    pub fn from_datagram(p: &[u8]) -> Result<Message, FormatError> {
        let header = IkeHeader::from_datagram(p)?;
        header.check_valid(p.len())?;
        let payloads = decode_payloads(&header, &p[IKE_HEADER_LENGTH..])?;
        Ok(Message { header, payloads })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dest = Vec::with_capacity(self.header.length as usize);
        self.header.encode(&mut dest);
        for (i, payload) in self.payloads.iter().enumerate() {
            let next_payload = self
                .payloads
                .get(i + 1)
                .map(|next| next.payload_type())
                .unwrap_or(PayloadType::NONE);
            payload.encode(next_payload, &mut dest);
        }
        dest
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IKEv2 message")?;
        writeln!(f, "  Initiator SPI {:x}", self.header.initiator_spi)?;
        writeln!(f, "  Responder SPI {:x}", self.header.responder_spi)?;
        writeln!(
            f,
            "  Version {}.{}",
            self.header.major_version, self.header.minor_version
        )?;
        writeln!(f, "  Exchange type {}", self.header.exchange_type)?;
        writeln!(
            f,
            "  Response {} from initiator {}",
            self.header.is_response, self.header.from_initiator
        )?;
        writeln!(f, "  Message ID {}", self.header.message_id)?;
        writeln!(f, "  Length {}", self.header.length)?;
        for payload in &self.payloads {
            let critical = if payload.critical {
                "critical"
            } else {
                "not critical"
            };
            writeln!(f, "  Payload type {}, {}", payload.payload_type(), critical)?;
            match payload.body {
                PayloadBody::SecurityAssociation(ref proposals) => {
                    for proposal in proposals {
                        writeln!(f, "    {:?}", proposal)?;
                    }
                }
                PayloadBody::KeyExchange(ref kex) => {
                    writeln!(f, "    DH group {} value {:?}", kex.dh_group, kex.data)?;
                }
                PayloadBody::Nonce(ref data) => writeln!(f, "    Value {:?}", data)?,
                PayloadBody::Notify(ref notify) => {
                    writeln!(
                        f,
                        "    Notify protocol ID {:?} SPI {:?} type {} value {:?}",
                        notify.protocol_id, notify.spi, notify.message_type, notify.data
                    )?;
                }
                PayloadBody::TrafficSelectorInitiator(ref selectors)
                | PayloadBody::TrafficSelectorResponder(ref selectors) => {
                    for selector in selectors {
                        writeln!(
                            f,
                            "    {} protocol {} ports {:?} addresses {:?}",
                            selector.ts_type,
                            selector.ip_protocol,
                            selector.port_range,
                            selector.addr_range
                        )?;
                    }
                }
                PayloadBody::Opaque { ref data, .. } => writeln!(f, "    Data {:?}", data)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FormatError {
    InvalidSyntax(&'static str),
    InvalidMajorVersion(u8),
    UnsupportedCriticalPayload(u8),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::InvalidSyntax(msg) => f.write_str(msg),
            Self::InvalidMajorVersion(version) => {
                write!(f, "Unsupported major version {}", version)
            }
            Self::UnsupportedCriticalPayload(payload_type) => {
                write!(f, "Unsupported critical payload {}", payload_type)
            }
        }
    }
}

impl error::Error for FormatError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError::InvalidSyntax(msg)
    }
}
