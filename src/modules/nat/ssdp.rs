//! SSDP discovery of UPnP internet gateway devices.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::Event;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use url::Url;

use super::NatError;
use super::xml::first_text;

const SSDP_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(239, 255, 255, 250), 1900);
const SEARCH_TARGETS: &[&str] = &[
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "ssdp:all",
];

pub(crate) const WAN_IP_SERVICE: &str = "WANIPConnection";

/// A WAN connection service exposed by a gateway device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WanService {
    pub service_type: String,
    pub control_url: Url,
}

/// Multicast an `M-SEARCH` and collect the `LOCATION` of every responder
/// within `window`.
pub async fn discover_locations(window: Duration) -> Result<Vec<Url>, NatError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    let target = SocketAddr::from(SSDP_ADDR);

    for search_target in SEARCH_TARGETS {
        let request = format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\nST: {search_target}\r\n\r\n"
        );
        socket.send_to(request.as_bytes(), target).await?;
    }

    let deadline = Instant::now() + window;
    let mut locations = BTreeSet::new();
    let mut buf = vec![0u8; 2048];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let reply = String::from_utf8_lossy(&buf[..len]);
                if let Some(location) = parse_location(&reply) {
                    log::trace!("ssdp reply from {from}: {location}");
                    locations.insert(location);
                }
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => break,
        }
    }

    log::info!("found {} UPnP devices on LAN", locations.len());
    Ok(locations.into_iter().collect())
}

/// Extract the `LOCATION` header of an SSDP reply.
pub fn parse_location(reply: &str) -> Option<Url> {
    reply.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("location")
            .then(|| Url::parse(value.trim()).ok())
            .flatten()
    })
}

/// Find the WAN IP connection service in a device description document.
pub fn find_wan_ip_service(description: &str, location: &Url) -> Option<WanService> {
    let base = first_text(description, "URLBase")
        .and_then(|base| Url::parse(&base).ok())
        .unwrap_or_else(|| location.clone());

    service_entries(description).into_iter().find_map(|entry| {
        if !entry.service_type.contains(WAN_IP_SERVICE) {
            return None;
        }
        let control_url = base.join(&entry.control_url).ok()?;
        Some(WanService {
            service_type: entry.service_type,
            control_url,
        })
    })
}

#[derive(Debug, Default)]
struct ServiceEntry {
    service_type: String,
    control_url: String,
}

#[derive(Debug, Clone, Copy)]
enum ServiceField {
    ServiceType,
    ControlUrl,
}

impl ServiceEntry {
    fn push(&mut self, field: ServiceField, text: &str) {
        match field {
            ServiceField::ServiceType => self.service_type.push_str(text),
            ServiceField::ControlUrl => self.control_url.push_str(text),
        }
    }

    fn finish(mut self) -> Self {
        self.service_type = self.service_type.trim().to_string();
        self.control_url = self.control_url.trim().to_string();
        self
    }
}

/// Every `<service>` of a description, in document order, however deeply
/// nested in embedded devices.
fn service_entries(description: &str) -> Vec<ServiceEntry> {
    let mut reader = Reader::from_str(description);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<ServiceEntry> = None;
    let mut field: Option<ServiceField> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                field = None;
                match start.local_name().as_ref() {
                    b"service" => current = Some(ServiceEntry::default()),
                    b"serviceType" => field = Some(ServiceField::ServiceType),
                    b"controlURL" => field = Some(ServiceField::ControlUrl),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                field = None;
                if end.local_name().as_ref() == b"service" {
                    entries.extend(current.take().map(ServiceEntry::finish));
                }
            }
            Ok(Event::Text(text)) => {
                if let (Some(entry), Some(field)) = (current.as_mut(), field) {
                    match text.unescape() {
                        Ok(text) => entry.push(field, &text),
                        Err(err) => log::debug!("bad text in device description: {err}"),
                    }
                }
            }
            Ok(Event::CData(text)) => {
                if let (Some(entry), Some(field)) = (current.as_mut(), field) {
                    entry.push(field, &String::from_utf8_lossy(&text));
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                log::debug!("malformed device description: {err}");
                break;
            }
            _ => {}
        }
    }
    entries
}
