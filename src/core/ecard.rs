//! Austrian e-card: DER encoded attribute list in EF 'EF01'.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::core::apdu::{exchange, ApduCommand, StatusWord};
use crate::core::asn1::{parse_der, Asn1Error, AttributeVisitor, Node, NodeKind, ObjectIdentifier};
use crate::core::error::{CardError, Result};
use crate::core::family::CardFamily;
use crate::core::file::{decode_tlv_length, read_file, ReadPolicy};
use crate::core::record::InsurantRecord;
use crate::core::transport::CardSession;

/// Sozialversicherungsnummer attribute
pub const INSURANT_ID_OID: &str = "1.2.40.0.10.1.4.1.1";

/// Largest Le a short READ BINARY can request
const PROBE_LEN: u16 = 256;

#[derive(Debug, Clone, Copy)]
enum Field {
    InsurantId,
    DateOfBirth,
    GivenName,
    Surname,
    Gender,
}

const TARGETS: [(&str, Field); 5] = [
    (INSURANT_ID_OID, Field::InsurantId),
    ("dateOfBirth", Field::DateOfBirth),
    ("givenName", Field::GivenName),
    ("surname", Field::Surname),
    ("gender", Field::Gender),
];

/// Run the full e-card read on a connected session
pub async fn read_insurant(session: &mut CardSession, policy: &ReadPolicy) -> Result<InsurantRecord> {
    log::info!("Reading e-card personal data from reader: {}", session.reader());

    let commands = CardFamily::At.commands();
    for step in [
        commands.select_root,
        commands.select_application,
        commands.select_personal_data,
    ] {
        exchange(session, &ApduCommand::from_bytes(step)?, &[StatusWord::SUCCESS]).await?;
    }

    let probe = exchange(session, &ApduCommand::read_binary(0, PROBE_LEN)?, &policy.success).await?;
    let total = decode_tlv_length(&probe)?;
    log::debug!("EF01 holds a {total} byte record");

    let data = read_file(session, 0, total, policy).await?;
    let record = decode_personal_data(&data)?;

    log::info!("e-card personal data read for insurant {}", record.insurant_id);
    Ok(record)
}

/// Extract the record from the DER contents of EF01
pub fn decode_personal_data(der: &[u8]) -> Result<InsurantRecord> {
    let root = parse_der(der)?;

    let mut fields = FieldCollector::default();
    root.visit_attributes(&mut fields)?;

    let mut record = InsurantRecord::empty(CardFamily::At);
    record.insurant_id = fields.insurant_id;
    record.date_of_birth = match normalize_date_of_birth(&fields.date_of_birth) {
        Ok(date) => date,
        Err(e) => {
            log::warn!("Dropping date of birth of insurant {}: {e}", record.insurant_id);
            String::new()
        }
    };
    record.first_name = fields.given_name;
    record.last_name = fields.surname;
    record.sex = fields.gender;
    Ok(record)
}

/// Bring a date of birth into `YYYYMMDD` form
pub fn normalize_date_of_birth(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(String::new());
    }

    let date = ["%Y%m%d%H%M%SZ", "%Y%m%d%H%M%S%.fZ", "%Y%m%d%H%M%S", "%Y%m%d%H%MZ"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|datetime| datetime.date())
        .or_else(|| {
            // GeneralizedTime with a local offset keeps the date as written
            ["%Y%m%d%H%M%S%z", "%Y%m%d%H%M%S%.f%z", "%Y%m%d%H%M%z"]
                .iter()
                .find_map(|format| DateTime::parse_from_str(raw, format).ok())
                .map(|datetime| datetime.date_naive())
        })
        .or_else(|| {
            ["%Y%m%d", "%Y-%m-%d"]
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        })
        .ok_or_else(|| CardError::Decode(format!("Unrecognized date of birth '{raw}'")))?;

    Ok(date.format("%Y%m%d").to_string())
}

#[derive(Debug, Default)]
struct FieldCollector {
    insurant_id: String,
    date_of_birth: String,
    given_name: String,
    surname: String,
    gender: String,
}

impl FieldCollector {
    fn slot(&mut self, field: Field) -> &mut String {
        match field {
            Field::InsurantId => &mut self.insurant_id,
            Field::DateOfBirth => &mut self.date_of_birth,
            Field::GivenName => &mut self.given_name,
            Field::Surname => &mut self.surname,
            Field::Gender => &mut self.gender,
        }
    }
}

impl AttributeVisitor for FieldCollector {
    fn visit_attribute(&mut self, oid: &ObjectIdentifier, value: &Node) -> Result<(), Asn1Error> {
        for (needle, field) in TARGETS {
            if !oid.matches(needle) {
                continue;
            }

            let first = value
                .children
                .first()
                .ok_or_else(|| Asn1Error::MissingValue(oid.to_string()))?;

            let text = match first.kind {
                NodeKind::Utf8String
                | NodeKind::GeneralizedTime
                | NodeKind::PrintableString
                | NodeKind::NumericString => first.text()?.unwrap_or_default(),
                other => {
                    log::debug!("Attribute {oid} holds {other:?}, leaving field empty");
                    String::new()
                }
            };

            *self.slot(field) = text;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{FileCard, ScriptedChannel};

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if content.len() < 0x80 {
            out.push(content.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(content);
        out
    }

    fn attribute(oid: &[u8], value: Vec<u8>) -> Vec<u8> {
        let mut content = tlv(0x06, oid);
        content.extend(tlv(0x31, &value));
        tlv(0x30, &content)
    }

    const INSURANT_ID: &[u8] = &[0x2A, 0x28, 0x00, 0x0A, 0x01, 0x04, 0x01, 0x01];
    const GIVEN_NAME: &[u8] = &[0x55, 0x04, 0x2A];
    const SURNAME: &[u8] = &[0x55, 0x04, 0x04];
    const DATE_OF_BIRTH: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x09, 0x01];
    const GENDER: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x09, 0x03];

    fn personal_data(extra: &[Vec<u8>]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend(attribute(INSURANT_ID, tlv(0x0C, b"A123456789")));
        content.extend(attribute(GIVEN_NAME, tlv(0x0C, b"Anna")));
        content.extend(attribute(SURNAME, tlv(0x0C, "Huber-Größ".as_bytes())));
        content.extend(attribute(DATE_OF_BIRTH, tlv(0x18, b"19800101120000Z")));
        content.extend(attribute(GENDER, tlv(0x13, b"F")));
        for attr in extra {
            content.extend_from_slice(attr);
        }
        tlv(0x30, &content)
    }

    #[test]
    fn test_decode_personal_data() {
        let record = decode_personal_data(&personal_data(&[])).unwrap();

        assert_eq!(record.card_type, CardFamily::At);
        assert_eq!(record.insurant_id, "A123456789");
        assert_eq!(record.first_name, "Anna");
        assert_eq!(record.last_name, "Huber-Größ");
        assert_eq!(record.date_of_birth, "19800101");
        assert_eq!(record.sex, "F");
        assert!(!record.has_address());
    }

    #[test]
    fn test_only_insurant_id() {
        let der = tlv(0x30, &attribute(INSURANT_ID, tlv(0x0C, b"A123456789")));
        let record = decode_personal_data(&der).unwrap();
        assert_eq!(record.insurant_id, "A123456789");
        assert_eq!(record.date_of_birth, "");
        assert_eq!(record.first_name, "");
    }

    #[test]
    fn test_non_text_value_leaves_field_empty() {
        let der = tlv(0x30, &attribute(GIVEN_NAME, tlv(0x02, &[0x01])));
        assert_eq!(decode_personal_data(&der).unwrap().first_name, "");
    }

    #[test]
    fn test_last_match_wins() {
        let der = personal_data(&[attribute(GIVEN_NAME, tlv(0x0C, b"Maria"))]);
        assert_eq!(decode_personal_data(&der).unwrap().first_name, "Maria");
    }

    #[test]
    fn test_empty_container_is_an_error() {
        let der = tlv(0x30, &attribute(SURNAME, Vec::new()));
        assert!(matches!(
            decode_personal_data(&der),
            Err(CardError::Asn1(Asn1Error::MissingValue(_)))
        ));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(decode_personal_data(&[0x30, 0x05, 0x06]), Err(CardError::Asn1(_))));
        assert!(matches!(
            decode_personal_data(&tlv(0x0C, b"flat")),
            Err(CardError::Asn1(Asn1Error::NotConstructed(_)))
        ));
    }

    #[test]
    fn test_normalize_date_of_birth() {
        assert_eq!(normalize_date_of_birth("19800101000000Z").unwrap(), "19800101");
        assert_eq!(normalize_date_of_birth("19751231").unwrap(), "19751231");
        assert_eq!(normalize_date_of_birth("1975-12-31").unwrap(), "19751231");
        assert_eq!(normalize_date_of_birth("").unwrap(), "");
        assert!(matches!(normalize_date_of_birth("31.12.1975"), Err(CardError::Decode(_))));
        assert!(normalize_date_of_birth("19751332").is_err());
    }

    #[test]
    fn test_normalize_offset_and_minute_precision() {
        assert_eq!(normalize_date_of_birth("19800101003000+0100").unwrap(), "19800101");
        assert_eq!(normalize_date_of_birth("198001012359-0500").unwrap(), "19800101");
        assert_eq!(normalize_date_of_birth("198001011200Z").unwrap(), "19800101");
    }

    #[test]
    fn test_unreadable_date_of_birth_keeps_record() {
        let mut content = attribute(INSURANT_ID, tlv(0x0C, b"A123456789"));
        content.extend(attribute(DATE_OF_BIRTH, tlv(0x13, b"31.12.1975")));
        content.extend(attribute(SURNAME, tlv(0x0C, b"Huber")));

        let record = decode_personal_data(&tlv(0x30, &content)).unwrap();
        assert_eq!(record.insurant_id, "A123456789");
        assert_eq!(record.last_name, "Huber");
        assert_eq!(record.date_of_birth, "");
    }

    #[test]
    fn test_read_insurant_end_to_end() {
        // Padding attribute pushes the record past one probe and several chunks
        let padding = attribute(&[0x2A, 0x03], tlv(0x04, &[0xEE; 400]));
        let file = personal_data(&[padding]);
        assert!(file.len() > 256);

        let card = FileCard::new(file.clone());
        let sent = card.sent();
        let mut session = CardSession::new("Reader", vec![], Box::new(card));

        let record = tokio_test::block_on(read_insurant(
            &mut session,
            &CardFamily::At.default_policy(),
        ))
        .unwrap();

        assert_eq!(record.insurant_id, "A123456789");
        assert_eq!(record.date_of_birth, "19800101");
        assert_eq!(record.street, "");

        let sent = sent.lock().unwrap();
        assert_eq!(sent[2], CardFamily::At.commands().select_personal_data.to_vec());
        assert_eq!(sent[3], vec![0x00, 0xB0, 0x00, 0x00, 0x00]);
        assert_eq!(
            sent.len(),
            4 + file.len().div_ceil(crate::core::file::MAX_CHUNK)
        );
    }

    #[test]
    fn test_select_failure_surfaces_status() {
        let channel = ScriptedChannel::new(vec![Ok(vec![0x6A, 0x82])]);
        let mut session = CardSession::new("Reader", vec![], Box::new(channel));

        let err = tokio_test::block_on(read_insurant(
            &mut session,
            &CardFamily::At.default_policy(),
        ))
        .unwrap_err();
        assert_eq!(err.status(), Some(StatusWord(0x6A82)));
    }
}
