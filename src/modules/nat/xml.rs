//! Small XML helpers shared by device description and SOAP parsing.
//!
//! Gateways disagree on namespace prefixes (`<u:NewExternalIPAddress>`,
//! `<m:errorCode>`), so elements are always matched by local name.

use quick_xml::Reader;
use quick_xml::events::Event;

/// Text of the first element whose local name is `name`, trimmed.
///
/// Returns `None` when the element is missing or the document is not
/// well-formed before it.
pub(crate) fn first_text(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut text: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if text.is_none() && start.local_name().as_ref() == name.as_bytes() => {
                text = Some(String::new());
            }
            Ok(Event::End(end)) if end.local_name().as_ref() == name.as_bytes() => {
                if let Some(text) = text.take() {
                    return Some(text.trim().to_string());
                }
            }
            Ok(Event::Empty(empty)) if text.is_none() && empty.local_name().as_ref() == name.as_bytes() => {
                return Some(String::new());
            }
            Ok(Event::Text(chunk)) => {
                if let Some(text) = text.as_mut() {
                    text.push_str(&chunk.unescape().ok()?);
                }
            }
            Ok(Event::CData(chunk)) => {
                if let Some(text) = text.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&chunk));
                }
            }
            Ok(Event::Eof) => return None,
            Err(err) => {
                log::debug!("malformed gateway xml while looking for <{name}>: {err}");
                return None;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_prefixed_elements_by_local_name() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Body><u:Reply xmlns:u="y"><u:NewExternalIPAddress>
            203.0.113.7 </u:NewExternalIPAddress></u:Reply></s:Body></s:Envelope>"#;
        assert_eq!(first_text(xml, "NewExternalIPAddress").as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn reads_cdata_and_entities() {
        let xml = "<r><errorDescription><![CDATA[Conflict <in> table]]></errorDescription><a>x &amp; y</a></r>";
        assert_eq!(first_text(xml, "errorDescription").as_deref(), Some("Conflict <in> table"));
        assert_eq!(first_text(xml, "a").as_deref(), Some("x & y"));
    }

    #[test]
    fn attributes_do_not_hide_the_element() {
        let xml = r#"<r><controlURL kind="abs">/ctl/IPConn</controlURL><empty/></r>"#;
        assert_eq!(first_text(xml, "controlURL").as_deref(), Some("/ctl/IPConn"));
        assert_eq!(first_text(xml, "empty").as_deref(), Some(""));
        assert!(first_text(xml, "missing").is_none());
    }
}
