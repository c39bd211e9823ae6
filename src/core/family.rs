//! Card families, their fixed command tables and ATR-based classification.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::apdu::StatusWord;
use crate::core::error::{CardError, Result};
use crate::core::file::ReadPolicy;
use crate::core::utils::{format_hex, parse_hex};

/// Supported health insurance cards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardFamily {
    /// German elektronische Gesundheitskarte
    #[serde(rename = "egk", alias = "DE")]
    De,
    /// Austrian e-card
    #[serde(rename = "ecard", alias = "AT")]
    At,
}

/// Commands that walk a card down to its personal data file
#[derive(Debug)]
pub struct CommandSet {
    pub select_root: &'static [u8],
    pub select_application: &'static [u8],
    pub select_personal_data: &'static [u8],
}

const EGK_COMMANDS: CommandSet = CommandSet {
    // SELECT root application by AID D2 76 00 01 44 80 00
    select_root: &[0x00, 0xA4, 0x04, 0x0C, 0x07, 0xD2, 0x76, 0x00, 0x01, 0x44, 0x80, 0x00],
    // SELECT DF.HCA by AID D2 76 00 00 01 02
    select_application: &[0x00, 0xA4, 0x04, 0x0C, 0x06, 0xD2, 0x76, 0x00, 0x00, 0x01, 0x02],
    // READ BINARY with SFI 01 (EF.PD), selects the file as a side effect
    select_personal_data: &[0x00, 0xB0, 0x81, 0x00, 0x02],
};

const ECARD_COMMANDS: CommandSet = CommandSet {
    // SELECT MF
    select_root: &[0x00, 0xA4, 0x00, 0x0C],
    // SELECT health card application by AID D0 40 00 00 17 01 01 01
    select_application: &[
        0x00, 0xA4, 0x04, 0x0C, 0x08, 0xD0, 0x40, 0x00, 0x00, 0x17, 0x01, 0x01, 0x01,
    ],
    // SELECT EF 'EF01'
    select_personal_data: &[0x00, 0xA4, 0x02, 0x0C, 0x02, 0xEF, 0x01],
};

impl CardFamily {
    pub fn commands(self) -> &'static CommandSet {
        match self {
            CardFamily::De => &EGK_COMMANDS,
            CardFamily::At => &ECARD_COMMANDS,
        }
    }

    /// Status handling used when no policy is configured.
    ///
    /// The eGK only ever reports 9000 for a good chunk and may end the file
    /// with 6B00 or 6282. The e-card answers the last chunk of a file with 6282
    /// alongside valid data, so that code counts as success there.
    pub fn default_policy(self) -> ReadPolicy {
        match self {
            CardFamily::De => ReadPolicy {
                success: vec![StatusWord::SUCCESS],
                end_of_file: vec![StatusWord::WRONG_OFFSET, StatusWord::END_OF_FILE],
            },
            CardFamily::At => ReadPolicy {
                success: vec![StatusWord::SUCCESS, StatusWord::END_OF_FILE],
                end_of_file: vec![StatusWord::WRONG_OFFSET],
            },
        }
    }
}

impl fmt::Display for CardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardFamily::De => write!(f, "DE"),
            CardFamily::At => write!(f, "AT"),
        }
    }
}

impl FromStr for CardFamily {
    type Err = CardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "de" | "egk" => Ok(CardFamily::De),
            "at" | "ecard" | "e-card" => Ok(CardFamily::At),
            _ => Err(CardError::Config(format!("Invalid card type: {s}"))),
        }
    }
}

/// ATRs of known eGK generations
pub const DEFAULT_DE_ATRS: &[&str] = &[
    "3BD396FF81B1FE451F078081052D",
    "3BD397FF81B1FE451F0780810512",
    "3BDD97FF81B1FE451F03006404050803739621D0009000C8",
    "3BDD96FF81B1FE451F038031B052020364041BB42281051B",
];

/// ATRs of known e-card generations
pub const DEFAULT_AT_ATRS: &[&str] = &[
    "3BBD18008131FE45805102670414B101010200810539",
    "3BBD18008131FE45805102670518B102020201810531",
    "3BDF18008131FE588031B05202046405C903AC73B7B1D444",
];

/// Known ATR fingerprints per card family, matched by exact equality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtrTable {
    de: HashSet<Vec<u8>>,
    at: HashSet<Vec<u8>>,
}

impl AtrTable {
    pub fn new(de: impl IntoIterator<Item = Vec<u8>>, at: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            de: de.into_iter().collect(),
            at: at.into_iter().collect(),
        }
    }

    /// Build a table from hex-encoded ATRs
    pub fn from_hex<S: AsRef<str>>(de: &[S], at: &[S]) -> Result<Self> {
        let parse = |list: &[S]| -> Result<Vec<Vec<u8>>> {
            list.iter()
                .map(|atr| {
                    parse_hex(atr.as_ref()).map_err(|e| CardError::Config(format!("Invalid ATR: {e:#}")))
                })
                .collect()
        };
        Ok(Self::new(parse(de)?, parse(at)?))
    }

    pub fn family_of(&self, atr: &[u8]) -> Option<CardFamily> {
        if self.de.contains(atr) {
            Some(CardFamily::De)
        } else if self.at.contains(atr) {
            Some(CardFamily::At)
        } else {
            None
        }
    }

    /// Determine the card family from an ATR, falling back to `fallback`
    /// for cards not in the table
    pub fn classify(&self, atr: &[u8], fallback: Option<CardFamily>) -> Result<CardFamily> {
        if let Some(family) = self.family_of(atr) {
            log::debug!("ATR {} identified as {family}", format_hex(atr));
            return Ok(family);
        }

        match fallback {
            Some(family) => {
                log::info!(
                    "ATR {} not recognized, using fallback {family}",
                    format_hex(atr)
                );
                Ok(family)
            }
            None => Err(CardError::UnknownCard { atr: atr.to_vec() }),
        }
    }
}

impl Default for AtrTable {
    fn default() -> Self {
        // The built-in lists are constants and always valid hex
        let parse = |list: &[&str]| -> Vec<Vec<u8>> {
            list.iter().filter_map(|atr| parse_hex(atr).ok()).collect()
        };
        Self::new(parse(DEFAULT_DE_ATRS), parse(DEFAULT_AT_ATRS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apdu::ApduCommand;

    #[test]
    fn test_default_table_fixtures() {
        let table = AtrTable::default();
        for atr in DEFAULT_DE_ATRS {
            assert_eq!(
                table.classify(&parse_hex(atr).unwrap(), None).unwrap(),
                CardFamily::De
            );
        }
        for atr in DEFAULT_AT_ATRS {
            assert_eq!(
                table.classify(&parse_hex(atr).unwrap(), None).unwrap(),
                CardFamily::At
            );
        }
    }

    #[test]
    fn test_unknown_atr_without_fallback() {
        let table = AtrTable::default();
        let atr = vec![0x3B, 0x75, 0x13, 0x00, 0x00, 0x47, 0x09, 0xEA, 0x90, 0x00];

        match table.classify(&atr, None) {
            Err(CardError::UnknownCard { atr: reported }) => assert_eq!(reported, atr),
            other => panic!("Expected UnknownCard, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_atr_with_fallback() {
        let table = AtrTable::default();
        let atr = vec![0x3B, 0x75, 0x13, 0x00];
        assert_eq!(
            table.classify(&atr, Some(CardFamily::At)).unwrap(),
            CardFamily::At
        );
        assert_eq!(
            table.classify(&atr, Some(CardFamily::De)).unwrap(),
            CardFamily::De
        );
    }

    #[test]
    fn test_known_atr_ignores_fallback() {
        let table = AtrTable::default();
        let atr = parse_hex(DEFAULT_DE_ATRS[0]).unwrap();
        assert_eq!(
            table.classify(&atr, Some(CardFamily::At)).unwrap(),
            CardFamily::De
        );
    }

    #[test]
    fn test_no_prefix_matching() {
        let table = AtrTable::default();
        let mut atr = parse_hex(DEFAULT_DE_ATRS[0]).unwrap();
        atr.push(0x00);
        assert!(table.classify(&atr, None).is_err());

        let truncated = &parse_hex(DEFAULT_AT_ATRS[0]).unwrap()[..10];
        assert!(table.classify(truncated, None).is_err());
    }

    #[test]
    fn test_from_hex() {
        let table = AtrTable::from_hex(&["3B 01 02"], &["3B0304"]).unwrap();
        assert_eq!(table.family_of(&[0x3B, 0x01, 0x02]), Some(CardFamily::De));
        assert_eq!(table.family_of(&[0x3B, 0x03, 0x04]), Some(CardFamily::At));
        assert!(AtrTable::from_hex(&["3B0"], &[]).is_err());
    }

    #[test]
    fn test_card_family_parse_and_display() {
        assert_eq!("DE".parse::<CardFamily>().unwrap(), CardFamily::De);
        assert_eq!("at".parse::<CardFamily>().unwrap(), CardFamily::At);
        assert_eq!("egk".parse::<CardFamily>().unwrap(), CardFamily::De);
        assert_eq!("e-card".parse::<CardFamily>().unwrap(), CardFamily::At);
        assert!("CH".parse::<CardFamily>().is_err());

        assert_eq!(CardFamily::De.to_string(), "DE");
        assert_eq!(serde_json::to_string(&CardFamily::De).unwrap(), "\"egk\"");
        assert_eq!(serde_json::to_string(&CardFamily::At).unwrap(), "\"ecard\"");
        assert_eq!(
            serde_json::from_str::<CardFamily>("\"AT\"").unwrap(),
            CardFamily::At
        );
    }

    #[test]
    fn test_command_tables_are_valid_apdus() {
        for family in [CardFamily::De, CardFamily::At] {
            let commands = family.commands();
            for bytes in [
                commands.select_root,
                commands.select_application,
                commands.select_personal_data,
            ] {
                let command = ApduCommand::from_bytes(bytes).unwrap();
                assert_eq!(command.to_bytes(), bytes.to_vec());
            }
        }
    }
}
