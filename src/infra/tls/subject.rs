//! Canonical subject rendering.
//!
//! Subjects are compared as strings, so the rendering must be stable. It
//! follows the RFC 2253 form produced by Go's `pkix.Name.String()`, which is
//! what deployed `cert_subject` values were written against: non-standard
//! attributes first, then C, ST, L, STREET, POSTALCODE, O, OU, CN and
//! SERIALNUMBER, the whole sequence reversed, RDNs joined with `,` and
//! multi-valued RDNs with `+`.
//!
//! Empty values of the multi-valued fields still render (`O=`), while an
//! empty CN or SERIALNUMBER is omitted. A standard attribute whose value is
//! not a string x509-parser can decode is dropped, as Go drops non-string
//! values of those attributes; Go decodes a few legacy string types
//! (T61String, BMPString) that may land here instead.

use x509_parser::{
    certificate::X509Certificate,
    prelude::FromDer,
    x509::{AttributeTypeAndValue, X509Name},
};

use super::{TlsError, policy::CertificateSummary};

const OID_COMMON_NAME: &str = "2.5.4.3";
const OID_SERIAL_NUMBER: &str = "2.5.4.5";
const OID_COUNTRY: &str = "2.5.4.6";
const OID_LOCALITY: &str = "2.5.4.7";
const OID_PROVINCE: &str = "2.5.4.8";
const OID_STREET_ADDRESS: &str = "2.5.4.9";
const OID_ORGANIZATION: &str = "2.5.4.10";
const OID_ORGANIZATIONAL_UNIT: &str = "2.5.4.11";
const OID_POSTAL_CODE: &str = "2.5.4.17";

/// Parse a DER certificate and return its rendered subject and serial.
pub fn summarize_certificate(der: &[u8]) -> Result<CertificateSummary, TlsError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|err| TlsError::Certificate(err.to_string()))?;
    Ok(CertificateSummary {
        subject: render_name(cert.subject()),
        serial: cert.raw_serial_as_string(),
    })
}

/// Render the subject of a DER certificate.
pub fn render_subject(der: &[u8]) -> Result<String, TlsError> {
    summarize_certificate(der).map(|summary| summary.subject)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttributeValue {
    Text(String),
    /// Hex of the DER encoding, rendered as `#<hex>`.
    Encoded(String),
}

#[derive(Debug, Clone)]
struct Attribute {
    oid: String,
    value: AttributeValue,
}

#[derive(Debug, Default)]
struct StandardFields {
    country: Vec<String>,
    province: Vec<String>,
    locality: Vec<String>,
    street_address: Vec<String>,
    postal_code: Vec<String>,
    organization: Vec<String>,
    organizational_unit: Vec<String>,
    common_name: Option<String>,
    serial_number: Option<String>,
}

fn render_name(name: &X509Name<'_>) -> String {
    let attributes: Vec<Attribute> = name
        .iter()
        .flat_map(|rdn| rdn.iter())
        .map(read_attribute)
        .collect();
    render_attributes(&attributes)
}

fn read_attribute(attr: &AttributeTypeAndValue<'_>) -> Attribute {
    let oid = attr.attr_type().to_id_string();
    let value = match attr.as_str() {
        Ok(text) => AttributeValue::Text(text.to_string()),
        Err(_) => {
            let any = attr.attr_value();
            let header = &any.header;
            AttributeValue::Encoded(hex::encode(encode_der(
                header.class() as u8,
                header.is_constructed(),
                header.tag().0,
                any.data,
            )))
        }
    };
    Attribute { oid, value }
}

fn render_attributes(attributes: &[Attribute]) -> String {
    let mut rdns: Vec<Vec<(String, AttributeValue)>> = Vec::new();
    let mut fields = StandardFields::default();

    for attr in attributes {
        if is_standard(&attr.oid) {
            if let AttributeValue::Text(text) = &attr.value {
                fields.absorb(&attr.oid, text.clone());
            }
        } else {
            rdns.push(vec![(attr.oid.clone(), encoded_for_unknown(&attr.value))]);
        }
    }

    fields.append_rdns(&mut rdns);

    rdns.iter()
        .rev()
        .map(|rdn| {
            rdn.iter()
                .map(|(oid, value)| render_pair(oid, value))
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl StandardFields {
    fn absorb(&mut self, oid: &str, value: String) {
        match oid {
            OID_COUNTRY => self.country.push(value),
            OID_PROVINCE => self.province.push(value),
            OID_LOCALITY => self.locality.push(value),
            OID_STREET_ADDRESS => self.street_address.push(value),
            OID_POSTAL_CODE => self.postal_code.push(value),
            OID_ORGANIZATION => self.organization.push(value),
            OID_ORGANIZATIONAL_UNIT => self.organizational_unit.push(value),
            OID_COMMON_NAME => self.common_name = Some(value),
            OID_SERIAL_NUMBER => self.serial_number = Some(value),
            _ => {}
        }
    }

    fn append_rdns(self, rdns: &mut Vec<Vec<(String, AttributeValue)>>) {
        let groups = [
            (OID_COUNTRY, self.country),
            (OID_PROVINCE, self.province),
            (OID_LOCALITY, self.locality),
            (OID_STREET_ADDRESS, self.street_address),
            (OID_POSTAL_CODE, self.postal_code),
            (OID_ORGANIZATION, self.organization),
            (OID_ORGANIZATIONAL_UNIT, self.organizational_unit),
            (OID_COMMON_NAME, non_empty(self.common_name)),
            (OID_SERIAL_NUMBER, non_empty(self.serial_number)),
        ];

        for (oid, values) in groups {
            if values.is_empty() {
                continue;
            }
            rdns.push(
                values
                    .into_iter()
                    .map(|value| (oid.to_string(), AttributeValue::Text(value)))
                    .collect(),
            );
        }
    }
}

fn non_empty(value: Option<String>) -> Vec<String> {
    value.filter(|v| !v.is_empty()).into_iter().collect()
}

fn is_standard(oid: &str) -> bool {
    short_name(oid).is_some()
}

fn short_name(oid: &str) -> Option<&'static str> {
    match oid {
        OID_COMMON_NAME => Some("CN"),
        OID_SERIAL_NUMBER => Some("SERIALNUMBER"),
        OID_COUNTRY => Some("C"),
        OID_LOCALITY => Some("L"),
        OID_PROVINCE => Some("ST"),
        OID_STREET_ADDRESS => Some("STREET"),
        OID_ORGANIZATION => Some("O"),
        OID_ORGANIZATIONAL_UNIT => Some("OU"),
        OID_POSTAL_CODE => Some("POSTALCODE"),
        _ => None,
    }
}

fn render_pair(oid: &str, value: &AttributeValue) -> String {
    match (short_name(oid), value) {
        (Some(name), AttributeValue::Text(text)) => format!("{name}={}", escape_value(text)),
        (_, AttributeValue::Encoded(hex)) => format!("{oid}=#{hex}"),
        (None, AttributeValue::Text(text)) => format!("{oid}={}", escape_value(text)),
    }
}

/// Non-standard attributes render as the DER of their value. String values
/// are re-encoded as PrintableString when every byte allows it, UTF8String
/// otherwise.
fn encoded_for_unknown(value: &AttributeValue) -> AttributeValue {
    match value {
        AttributeValue::Encoded(hex) => AttributeValue::Encoded(hex.clone()),
        AttributeValue::Text(text) => {
            let tag = if text.bytes().all(is_printable) {
                0x13
            } else {
                0x0c
            };
            AttributeValue::Encoded(hex::encode(encode_der(0, false, tag, text.as_bytes())))
        }
    }
}

fn is_printable(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b' ' | b'\'' | b'(' | b')' | b'+' | b',' | b'-' | b'.' | b'/' | b':' | b'=' | b'?' | b'*'
        )
}

fn escape_value(value: &str) -> String {
    let char_count = value.chars().count();
    let mut escaped = String::with_capacity(value.len());
    for (idx, ch) in value.chars().enumerate() {
        let needs_escape = match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => true,
            ' ' => idx == 0 || idx + 1 == char_count,
            '#' => idx == 0,
            _ => false,
        };
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn encode_der(class: u8, constructed: bool, tag: u32, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    let leading = (class << 6) | if constructed { 0x20 } else { 0 };
    if tag < 31 {
        out.push(leading | tag as u8);
    } else {
        out.push(leading | 0x1f);
        let mut groups = Vec::new();
        let mut rest = tag;
        loop {
            groups.push((rest & 0x7f) as u8);
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        for (idx, group) in groups.iter().enumerate().rev() {
            out.push(if idx == 0 { *group } else { group | 0x80 });
        }
    }

    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }

    out.extend_from_slice(content);
    out
}
