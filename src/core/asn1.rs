//! Minimal DER tree decoder.
//!
//! Parses definite-length BER/DER into a tree of [`Node`]s with explicit
//! kinds, enough to walk the attribute lists stored on health cards. Values
//! are not interpreted beyond object identifiers and character strings.

use std::fmt;

use thiserror::Error;

/// Nesting limit, far above anything found on a card file
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Asn1Error {
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    #[error("Indefinite length at offset {0} is not allowed in DER")]
    IndefiniteLength(usize),

    #[error("Length at offset {0} is too large")]
    LengthTooLarge(usize),

    #[error("Tag number at offset {0} is too large")]
    TagTooLong(usize),

    #[error("Nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("Invalid object identifier encoding")]
    InvalidObjectIdentifier,

    #[error("Invalid {0:?} contents")]
    InvalidString(NodeKind),

    #[error("Expected a constructed element, found {0:?}")]
    NotConstructed(NodeKind),

    #[error("Attribute {0} has no value")]
    MissingValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl TagClass {
    fn from_bits(byte: u8) -> Self {
        match byte >> 6 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::ContextSpecific,
            _ => TagClass::Private,
        }
    }
}

/// What an element is, derived from its tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Boolean,
    Integer,
    OctetString,
    Null,
    ObjectIdentifier,
    Utf8String,
    NumericString,
    PrintableString,
    Ia5String,
    UtcTime,
    GeneralizedTime,
    Sequence,
    Set,
    ContextSpecific(u32),
    Other { class: TagClass, number: u32 },
}

impl NodeKind {
    fn from_tag(class: TagClass, number: u32) -> Self {
        match (class, number) {
            (TagClass::Universal, 0x01) => NodeKind::Boolean,
            (TagClass::Universal, 0x02) => NodeKind::Integer,
            (TagClass::Universal, 0x04) => NodeKind::OctetString,
            (TagClass::Universal, 0x05) => NodeKind::Null,
            (TagClass::Universal, 0x06) => NodeKind::ObjectIdentifier,
            (TagClass::Universal, 0x0C) => NodeKind::Utf8String,
            (TagClass::Universal, 0x10) => NodeKind::Sequence,
            (TagClass::Universal, 0x11) => NodeKind::Set,
            (TagClass::Universal, 0x12) => NodeKind::NumericString,
            (TagClass::Universal, 0x13) => NodeKind::PrintableString,
            (TagClass::Universal, 0x16) => NodeKind::Ia5String,
            (TagClass::Universal, 0x17) => NodeKind::UtcTime,
            (TagClass::Universal, 0x18) => NodeKind::GeneralizedTime,
            (TagClass::ContextSpecific, n) => NodeKind::ContextSpecific(n),
            (class, number) => NodeKind::Other { class, number },
        }
    }

    /// Whether the contents are character data
    pub fn is_text(self) -> bool {
        matches!(
            self,
            NodeKind::Utf8String
                | NodeKind::NumericString
                | NodeKind::PrintableString
                | NodeKind::Ia5String
                | NodeKind::UtcTime
                | NodeKind::GeneralizedTime
        )
    }
}

/// A decoded element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub constructed: bool,
    /// Raw value bytes; for constructed elements the encoded children
    pub content: Vec<u8>,
    pub children: Vec<Node>,
}

/// Decode the first element of `data`. Trailing bytes are ignored, card
/// files are commonly padded past the end of the record.
pub fn parse_der(data: &[u8]) -> Result<Node, Asn1Error> {
    let (node, _) = parse_element(data, 0, 0)?;
    Ok(node)
}

fn parse_element(data: &[u8], start: usize, depth: usize) -> Result<(Node, usize), Asn1Error> {
    if depth > MAX_DEPTH {
        return Err(Asn1Error::TooDeep);
    }

    let mut pos = start;
    let first = *data.get(pos).ok_or(Asn1Error::UnexpectedEnd(pos))?;
    pos += 1;

    let class = TagClass::from_bits(first);
    let constructed = first & 0x20 != 0;
    let mut number = (first & 0x1F) as u32;

    if number == 0x1F {
        number = 0;
        loop {
            let byte = *data.get(pos).ok_or(Asn1Error::UnexpectedEnd(pos))?;
            pos += 1;
            if number > (u32::MAX >> 7) {
                return Err(Asn1Error::TagTooLong(start));
            }
            number = (number << 7) | (byte & 0x7F) as u32;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }

    let length_offset = pos;
    let length_byte = *data.get(pos).ok_or(Asn1Error::UnexpectedEnd(pos))?;
    pos += 1;

    let length = if length_byte & 0x80 == 0 {
        length_byte as usize
    } else {
        let count = (length_byte & 0x7F) as usize;
        if count == 0 {
            return Err(Asn1Error::IndefiniteLength(length_offset));
        }
        if count > 4 {
            return Err(Asn1Error::LengthTooLarge(length_offset));
        }
        let bytes = data
            .get(pos..pos + count)
            .ok_or(Asn1Error::UnexpectedEnd(data.len()))?;
        pos += count;
        bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
    };

    let end = pos
        .checked_add(length)
        .ok_or(Asn1Error::LengthTooLarge(length_offset))?;
    let content = data.get(pos..end).ok_or(Asn1Error::UnexpectedEnd(data.len()))?;

    let mut children = Vec::new();
    if constructed {
        let mut child_pos = 0;
        while child_pos < content.len() {
            let (child, next) = parse_element(content, child_pos, depth + 1)?;
            children.push(child);
            child_pos = next;
        }
    }

    let node = Node {
        kind: NodeKind::from_tag(class, number),
        constructed,
        content: content.to_vec(),
        children,
    };

    Ok((node, end))
}

impl Node {
    /// Decoded character data for string and time kinds, `None` otherwise
    pub fn text(&self) -> Result<Option<String>, Asn1Error> {
        if !self.kind.is_text() || self.constructed {
            return Ok(None);
        }
        String::from_utf8(self.content.clone())
            .map(Some)
            .map_err(|_| Asn1Error::InvalidString(self.kind))
    }

    pub fn object_identifier(&self) -> Result<ObjectIdentifier, Asn1Error> {
        if self.kind != NodeKind::ObjectIdentifier || self.constructed {
            return Err(Asn1Error::InvalidObjectIdentifier);
        }
        ObjectIdentifier::from_der(&self.content)
    }

    /// Walk immediate children shaped like `SEQUENCE { OID, container }`
    /// and hand each one to `visitor`
    pub fn visit_attributes<V: AttributeVisitor>(&self, visitor: &mut V) -> Result<(), Asn1Error> {
        if !self.constructed {
            return Err(Asn1Error::NotConstructed(self.kind));
        }

        for child in &self.children {
            if let [first, value] = child.children.as_slice() {
                if first.kind == NodeKind::ObjectIdentifier {
                    let oid = first.object_identifier()?;
                    visitor.visit_attribute(&oid, value)?;
                }
            }
        }

        Ok(())
    }
}

/// Receives the attributes found by [`Node::visit_attributes`]
pub trait AttributeVisitor {
    fn visit_attribute(&mut self, oid: &ObjectIdentifier, value: &Node) -> Result<(), Asn1Error>;
}

/// Dotted object identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdentifier(String);

impl ObjectIdentifier {
    pub fn from_der(bytes: &[u8]) -> Result<Self, Asn1Error> {
        if bytes.is_empty() || bytes.last().is_some_and(|b| b & 0x80 != 0) {
            return Err(Asn1Error::InvalidObjectIdentifier);
        }

        let mut arcs: Vec<u64> = Vec::new();
        let mut value: u64 = 0;
        for &byte in bytes {
            if value > (u64::MAX >> 7) {
                return Err(Asn1Error::InvalidObjectIdentifier);
            }
            value = (value << 7) | (byte & 0x7F) as u64;
            if byte & 0x80 == 0 {
                if arcs.is_empty() {
                    let first = (value / 40).min(2);
                    arcs.push(first);
                    arcs.push(value - first * 40);
                } else {
                    arcs.push(value);
                }
                value = 0;
            }
        }

        let dotted = arcs
            .iter()
            .map(|arc| arc.to_string())
            .collect::<Vec<_>>()
            .join(".");
        Ok(Self(dotted))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Well-known attribute name for this OID
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.0.as_str() {
            "2.5.4.3" => "commonName",
            "2.5.4.4" => "surname",
            "2.5.4.6" => "countryName",
            "2.5.4.12" => "title",
            "2.5.4.42" => "givenName",
            "2.5.4.43" => "initials",
            "2.5.4.44" => "generationQualifier",
            "1.3.6.1.5.5.7.9.1" => "dateOfBirth",
            "1.3.6.1.5.5.7.9.2" => "placeOfBirth",
            "1.3.6.1.5.5.7.9.3" => "gender",
            "1.3.6.1.5.5.7.9.4" => "countryOfCitizenship",
            "1.3.6.1.5.5.7.9.5" => "countryOfResidence",
            _ => return None,
        };
        Some(name)
    }

    /// Substring match against the dotted form or the attribute name
    pub fn matches(&self, needle: &str) -> bool {
        self.0.contains(needle) || self.name().is_some_and(|name| name.contains(needle))
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}
