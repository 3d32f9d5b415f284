//! SOAP actions against a `WANIPConnection` control endpoint.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::ssdp::WanService;
use super::xml::first_text;
use super::{NatError, PortMapper, PortMapping, Protocol};

/// UPnP error code for "NoSuchEntryInArray".
const NO_SUCH_ENTRY: u16 = 714;

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Internet gateway reached through its `WANIPConnection` SOAP endpoint.
#[derive(Debug, Clone)]
pub struct IgdGateway {
    client: reqwest::Client,
    service: WanService,
}

impl IgdGateway {
    pub fn new(client: reqwest::Client, service: WanService) -> Self {
        Self { client, service }
    }

    pub fn service(&self) -> &WanService {
        &self.service
    }

    async fn call(&self, action: &'static str, args: &[(&str, String)]) -> Result<String, NatError> {
        let body = envelope(&self.service.service_type, action, args)?;
        let response = self
            .client
            .post(self.service.control_url.clone())
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{action}\"", self.service.service_type))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        let code = first_text(&text, "errorCode").and_then(|code| code.parse().ok());
        let message = first_text(&text, "errorDescription").unwrap_or_else(|| status.to_string());
        Err(NatError::Soap { action, code, message })
    }
}

#[async_trait]
impl PortMapper for IgdGateway {
    async fn external_ip(&self) -> Result<IpAddr, NatError> {
        let reply = self.call("GetExternalIPAddress", &[]).await?;
        first_text(&reply, "NewExternalIPAddress")
            .and_then(|ip| ip.parse().ok())
            .ok_or(NatError::CouldNotDetermineWanIp)
    }

    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), NatError> {
        let args = [
            ("NewRemoteHost", remote_host(mapping.remote_host)),
            ("NewExternalPort", mapping.external_port.to_string()),
            ("NewProtocol", mapping.protocol.as_str().to_string()),
            ("NewInternalPort", mapping.internal_port.to_string()),
            ("NewInternalClient", mapping.internal_client.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", mapping.description.clone()),
            ("NewLeaseDuration", lease_seconds(mapping.lease)),
        ];
        self.call("AddPortMapping", &args).await.map(|_| ())
    }

    async fn delete_port_mapping(
        &self,
        remote: Option<IpAddr>,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), NatError> {
        let args = [
            ("NewRemoteHost", remote_host(remote)),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol.as_str().to_string()),
        ];
        match self.call("DeletePortMapping", &args).await {
            Err(NatError::Soap {
                code: Some(NO_SUCH_ENTRY),
                ..
            }) => {
                log::debug!("port mapping {external_port} already gone");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

fn remote_host(remote: Option<IpAddr>) -> String {
    remote.map(|ip| ip.to_string()).unwrap_or_default()
}

fn lease_seconds(lease: Duration) -> String {
    lease.as_secs().to_string()
}

/// Render a SOAP 1.1 request envelope.
pub fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> Result<String, NatError> {
    let action_tag = format!("u:{action}");
    let mut events = vec![
        Event::Decl(BytesDecl::new("1.0", None, None)),
        Event::Start(
            BytesStart::new("s:Envelope")
                .with_attributes([("xmlns:s", SOAP_ENVELOPE_NS), ("s:encodingStyle", SOAP_ENCODING)]),
        ),
        Event::Start(BytesStart::new("s:Body")),
        Event::Start(BytesStart::new(action_tag.as_str()).with_attributes([("xmlns:u", service_type)])),
    ];
    for (name, value) in args {
        events.push(Event::Start(BytesStart::new(*name)));
        events.push(Event::Text(BytesText::new(value)));
        events.push(Event::End(BytesEnd::new(*name)));
    }
    events.push(Event::End(BytesEnd::new(action_tag.as_str())));
    events.push(Event::End(BytesEnd::new("s:Body")));
    events.push(Event::End(BytesEnd::new("s:Envelope")));

    let mut writer = Writer::new(Vec::new());
    for event in events {
        writer
            .write_event(event)
            .map_err(|err| NatError::Xml(err.to_string()))?;
    }
    String::from_utf8(writer.into_inner()).map_err(|err| NatError::Xml(err.to_string()))
}
