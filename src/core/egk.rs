//! German eGK: compressed XML in EF.PD.
//!
//! EF.PD starts with a 2-byte big-endian length followed by a gzip (or raw
//! deflate) compressed, ISO-8859-15 encoded `UC_PersoenlicheVersichertendatenXML`
//! document.

use std::io::{ErrorKind, Read};

use flate2::read::{DeflateDecoder, GzDecoder};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::core::apdu::{exchange, ApduCommand, StatusWord};
use crate::core::error::{CardError, Result};
use crate::core::family::CardFamily;
use crate::core::file::{read_file, ReadPolicy};
use crate::core::record::InsurantRecord;
use crate::core::transport::CardSession;

const ROOT_ELEMENT: &str = "UC_PersoenlicheVersichertendatenXML";
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Run the full eGK read on a connected session
pub async fn read_insurant(session: &mut CardSession, policy: &ReadPolicy) -> Result<InsurantRecord> {
    log::info!("Reading eGK personal data from reader: {}", session.reader());

    let commands = CardFamily::De.commands();
    for step in [
        commands.select_root,
        commands.select_application,
        commands.select_personal_data,
    ] {
        exchange(session, &ApduCommand::from_bytes(step)?, &[StatusWord::SUCCESS]).await?;
    }

    let header = exchange(session, &ApduCommand::read_binary(0, 2)?, &policy.success).await?;
    let length = match header.as_slice() {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]) as usize,
        _ => {
            return Err(CardError::Decode(format!(
                "EF.PD length header has {} bytes, expected 2",
                header.len()
            )))
        }
    };
    if length < 2 {
        return Err(CardError::Decode(format!("EF.PD length {length} is too small")));
    }

    let payload = read_file(session, 2, length - 2, policy).await?;
    log::debug!("Read {} compressed bytes from EF.PD", payload.len());

    let xml = inflate(&payload)?;
    let record = decode_personal_data(&xml)?;

    log::info!("eGK personal data read for insurant {}", record.insurant_id);
    Ok(record)
}

/// Decompress an EF.PD payload.
///
/// Cards do not always store the gzip trailer or the final deflate block, so
/// a stream that ends early yields whatever was inflated up to that point.
pub fn inflate(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.starts_with(&GZIP_MAGIC) {
        read_to_end_lenient(GzDecoder::new(payload))
    } else {
        read_to_end_lenient(DeflateDecoder::new(payload))
    }
}

fn read_to_end_lenient(mut reader: impl Read) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && !out.is_empty() => {
                log::warn!("Compressed stream ended early after {} bytes", out.len());
                break;
            }
            Err(e) => return Err(CardError::Inflate(e)),
        }
    }

    if out.is_empty() {
        return Err(CardError::Inflate(std::io::Error::new(
            ErrorKind::InvalidData,
            "compressed stream produced no data",
        )));
    }

    Ok(out)
}

/// Turn the decompressed ISO-8859-15 XML into a record
pub fn decode_personal_data(latin9: &[u8]) -> Result<InsurantRecord> {
    let (text, _) = encoding_rs::ISO_8859_15.decode_without_bom_handling(latin9);
    let root = parse_xml(&text)?;

    if root.name != ROOT_ELEMENT {
        return Err(CardError::Xml(format!(
            "Unexpected root element '{}', expected '{ROOT_ELEMENT}'",
            root.name
        )));
    }

    let insurant = root.child("Versicherter");
    let person = insurant.and_then(|v| v.child("Person"));
    let address = person.and_then(|p| p.child("StrassenAdresse"));

    Ok(InsurantRecord {
        card_type: CardFamily::De,
        insurant_id: text_of(insurant, &["Versicherten_ID"]),
        date_of_birth: text_of(person, &["Geburtsdatum"]),
        first_name: text_of(person, &["Vorname"]),
        last_name: text_of(person, &["Nachname"]),
        sex: text_of(person, &["Geschlecht"]),
        street: text_of(address, &["Strasse"]),
        house_number: text_of(address, &["Hausnummer"]),
        zip_code: text_of(address, &["Postleitzahl"]),
        city: text_of(address, &["Ort"]),
        country: text_of(address, &["Land", "Wohnsitzlaendercode"]),
    })
}

fn text_of(element: Option<&Element>, path: &[&str]) -> String {
    element
        .and_then(|e| e.find(path))
        .map(|e| e.text.clone())
        .unwrap_or_default()
}

/// XML element with the namespace prefix dropped from its name
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn named(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Self::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |element, name| element.child(name))
    }
}

fn parse_xml(text: &str) -> Result<Element> {
    let xml_error = |e: quick_xml::Error| CardError::Xml(e.to_string());

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => stack.push(Element::named(e.local_name().as_ref())),
            Event::Empty(e) => attach(&mut stack, &mut root, Element::named(e.local_name().as_ref())),
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| CardError::Xml("Unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, element);
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(CardError::Xml(format!(
            "Document ended inside element '{}'",
            stack.last().map(|e| e.name.as_str()).unwrap_or_default()
        )));
    }

    root.ok_or_else(|| CardError::Xml("Document has no root element".to_string()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => log::warn!("Ignoring second top-level element '{}'", element.name),
    }
}
