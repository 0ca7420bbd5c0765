use std::collections::BTreeMap;

use orion_error::prelude::*;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::error::{CoreReason, CoreResult};
use crate::token::{TokenId, WorkflowVersion};

// ---------------------------------------------------------------------------
// Payload model
// ---------------------------------------------------------------------------

/// On-the-wire carrier of a token: the only mutable state passed between
/// control nodes. Four sections, all fields string-typed on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub header: Header,
    pub service: ServiceRef,
    pub attributes: Vec<JoinAttribute>,
    pub monitor: Vec<MonitorEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub sequence_id: TokenId,
    pub rule_base_version: WorkflowVersion,
    pub created_at: Option<u64>,
    pub updated_at: Option<u64>,
}

/// The (service, operation) a payload is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub service: String,
    pub operation: String,
}

/// One named attribute with an optional per-attribute deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAttribute {
    pub name: String,
    pub value: String,
    /// Epoch millis after which the carrying token is expired.
    pub not_after: Option<u64>,
}

/// Per-hop instrumentation timestamps, appended by each control node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    pub service: String,
    pub received_at: u64,
    pub dispatched_at: u64,
}

impl Payload {
    /// The effective deadline of the carrying token: the minimum of its
    /// attributes' `notAfter` fields, if any carry one.
    pub fn effective_deadline(&self) -> Option<u64> {
        self.attributes.iter().filter_map(|a| a.not_after).min()
    }

    /// Attribute name → value view, for service invocation and guards.
    pub fn attribute_map(&self) -> BTreeMap<&str, &str> {
        self.attributes
            .iter()
            .map(|a| (a.name.as_str(), a.value.as_str()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parsing (roxmltree)
// ---------------------------------------------------------------------------

impl Payload {
    /// Parse a wire payload. The document root must contain exactly the four
    /// top-level sections `header`, `service`, `joinAttribute`,
    /// `monitorData`; `sequenceId`, `ruleBaseVersion`, `serviceName` and
    /// `operation` are required fields.
    pub fn parse(xml: &str) -> CoreResult<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| malformed(format!("invalid XML: {e}")))?;
        let root = doc.root_element();

        let header_el = required_child(&root, "header")?;
        let service_el = required_child(&root, "service")?;
        let attrs_el = required_child(&root, "joinAttribute")?;
        let monitor_el = required_child(&root, "monitorData")?;

        let sequence_id = required_text(&header_el, "sequenceId")?
            .parse::<u64>()
            .map(TokenId::new)
            .map_err(|_| malformed("sequenceId is not an unsigned integer"))?;
        let rule_base_version = required_text(&header_el, "ruleBaseVersion")?
            .parse::<WorkflowVersion>()
            .map_err(|e| malformed(format!("bad ruleBaseVersion: {e}")))?;
        let header = Header {
            sequence_id,
            rule_base_version,
            created_at: optional_millis(&header_el, "createdAt")?,
            updated_at: optional_millis(&header_el, "updatedAt")?,
        };

        let service = ServiceRef {
            service: required_text(&service_el, "serviceName")?.to_string(),
            operation: required_text(&service_el, "operation")?.to_string(),
        };

        let mut attributes = Vec::new();
        for attr_el in attrs_el.children().filter(|n| n.has_tag_name("attribute")) {
            attributes.push(JoinAttribute {
                name: required_text(&attr_el, "attributeName")?.to_string(),
                value: required_text(&attr_el, "attributeValue")?.to_string(),
                not_after: optional_millis(&attr_el, "notAfter")?,
            });
        }

        let mut monitor = Vec::new();
        for entry_el in monitor_el.children().filter(|n| n.has_tag_name("entry")) {
            monitor.push(MonitorEntry {
                service: required_text(&entry_el, "serviceName")?.to_string(),
                received_at: required_millis(&entry_el, "receivedAt")?,
                dispatched_at: required_millis(&entry_el, "dispatchedAt")?,
            });
        }

        Ok(Self {
            header,
            service,
            attributes,
            monitor,
        })
    }
}

fn malformed(detail: impl Into<String>) -> crate::error::CoreError {
    StructError::from(CoreReason::MalformedPayload).with_detail(detail.into())
}

fn required_child<'a, 'input>(
    node: &roxmltree::Node<'a, 'input>,
    name: &str,
) -> CoreResult<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| malformed(format!("missing <{name}> element")))
}

fn required_text<'a>(node: &roxmltree::Node<'a, '_>, name: &str) -> CoreResult<&'a str> {
    let child = required_child(node, name)?;
    child
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| malformed(format!("empty <{name}> element")))
}

fn required_millis(node: &roxmltree::Node<'_, '_>, name: &str) -> CoreResult<u64> {
    required_text(node, name)?
        .parse::<u64>()
        .map_err(|_| malformed(format!("<{name}> is not epoch millis")))
}

fn optional_millis(node: &roxmltree::Node<'_, '_>, name: &str) -> CoreResult<Option<u64>> {
    match node.children().find(|n| n.has_tag_name(name)) {
        None => Ok(None),
        Some(_) => required_millis(node, name).map(Some),
    }
}

// ---------------------------------------------------------------------------
// Serialization (quick-xml)
// ---------------------------------------------------------------------------

impl Payload {
    /// Serialize to the wire XML form.
    pub fn to_xml(&self) -> CoreResult<String> {
        let mut writer = Writer::new(Vec::new());

        start(&mut writer, "payload")?;

        start(&mut writer, "header")?;
        text_el(&mut writer, "sequenceId", &self.header.sequence_id.to_string())?;
        text_el(
            &mut writer,
            "ruleBaseVersion",
            &self.header.rule_base_version.to_string(),
        )?;
        if let Some(ts) = self.header.created_at {
            text_el(&mut writer, "createdAt", &ts.to_string())?;
        }
        if let Some(ts) = self.header.updated_at {
            text_el(&mut writer, "updatedAt", &ts.to_string())?;
        }
        end(&mut writer, "header")?;

        start(&mut writer, "service")?;
        text_el(&mut writer, "serviceName", &self.service.service)?;
        text_el(&mut writer, "operation", &self.service.operation)?;
        end(&mut writer, "service")?;

        start(&mut writer, "joinAttribute")?;
        for attr in &self.attributes {
            start(&mut writer, "attribute")?;
            text_el(&mut writer, "attributeName", &attr.name)?;
            text_el(&mut writer, "attributeValue", &attr.value)?;
            if let Some(deadline) = attr.not_after {
                text_el(&mut writer, "notAfter", &deadline.to_string())?;
            }
            end(&mut writer, "attribute")?;
        }
        end(&mut writer, "joinAttribute")?;

        start(&mut writer, "monitorData")?;
        for entry in &self.monitor {
            start(&mut writer, "entry")?;
            text_el(&mut writer, "serviceName", &entry.service)?;
            text_el(&mut writer, "receivedAt", &entry.received_at.to_string())?;
            text_el(&mut writer, "dispatchedAt", &entry.dispatched_at.to_string())?;
            end(&mut writer, "entry")?;
        }
        end(&mut writer, "monitorData")?;

        end(&mut writer, "payload")?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| malformed(format!("payload not UTF-8: {e}")))
    }
}

fn start(writer: &mut Writer<Vec<u8>>, tag: &str) -> CoreResult<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(|e| malformed(format!("XML write: {e}")))
}

fn end(writer: &mut Writer<Vec<u8>>, tag: &str) -> CoreResult<()> {
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|e| malformed(format!("XML write: {e}")))
}

fn text_el(writer: &mut Writer<Vec<u8>>, tag: &str, value: &str) -> CoreResult<()> {
    start(writer, tag)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(|e| malformed(format!("XML write: {e}")))?;
    end(writer, tag)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Payload {
        Payload {
            header: Header {
                sequence_id: TokenId::new(1_000_001),
                rule_base_version: "v001".parse().unwrap(),
                created_at: Some(1_700_000_000_000),
                updated_at: None,
            },
            service: ServiceRef {
                service: "triage".into(),
                operation: "assess".into(),
            },
            attributes: vec![
                JoinAttribute {
                    name: "vitals".into(),
                    value: "stable".into(),
                    not_after: Some(1_700_000_060_000),
                },
                JoinAttribute {
                    name: "patientId".into(),
                    value: "p-17".into(),
                    not_after: None,
                },
            ],
            monitor: vec![MonitorEntry {
                service: "intake".into(),
                received_at: 1_700_000_000_100,
                dispatched_at: 1_700_000_000_150,
            }],
        }
    }

    #[test]
    fn xml_round_trip() {
        let payload = sample_payload();
        let xml = payload.to_xml().unwrap();
        let parsed = Payload::parse(&xml).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn parse_minimal_document() {
        let xml = r#"<payload>
            <header>
                <sequenceId>1000001</sequenceId>
                <ruleBaseVersion>v001</ruleBaseVersion>
            </header>
            <service>
                <serviceName>triage</serviceName>
                <operation>assess</operation>
            </service>
            <joinAttribute/>
            <monitorData/>
        </payload>"#;
        let payload = Payload::parse(xml).unwrap();
        assert_eq!(payload.header.sequence_id, TokenId::new(1_000_001));
        assert!(payload.attributes.is_empty());
        assert!(payload.monitor.is_empty());
        assert!(payload.effective_deadline().is_none());
    }

    #[test]
    fn missing_section_is_malformed() {
        let xml = r#"<payload>
            <header>
                <sequenceId>1</sequenceId>
                <ruleBaseVersion>v001</ruleBaseVersion>
            </header>
            <service><serviceName>s</serviceName><operation>o</operation></service>
            <joinAttribute/>
        </payload>"#;
        assert!(Payload::parse(xml).is_err());
    }

    #[test]
    fn missing_sequence_id_is_malformed() {
        let xml = r#"<payload>
            <header><ruleBaseVersion>v001</ruleBaseVersion></header>
            <service><serviceName>s</serviceName><operation>o</operation></service>
            <joinAttribute/>
            <monitorData/>
        </payload>"#;
        assert!(Payload::parse(xml).is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(Payload::parse("not xml at all").is_err());
        assert!(Payload::parse("<payload></payload>").is_err());
    }

    #[test]
    fn effective_deadline_is_min_not_after() {
        let mut payload = sample_payload();
        payload.attributes.push(JoinAttribute {
            name: "lab".into(),
            value: "pending".into(),
            not_after: Some(1_700_000_030_000),
        });
        assert_eq!(payload.effective_deadline(), Some(1_700_000_030_000));
    }

    #[test]
    fn attribute_values_escape_cleanly() {
        let mut payload = sample_payload();
        payload.attributes[0].value = "a<b&\"c\">".into();
        let xml = payload.to_xml().unwrap();
        let parsed = Payload::parse(&xml).unwrap();
        assert_eq!(parsed.attributes[0].value, "a<b&\"c\">");
    }
}
