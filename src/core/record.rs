use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::family::CardFamily;

/// Identity data read from a health card, common to both card families
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsurantRecord {
    pub card_type: CardFamily,
    pub insurant_id: String,
    /// YYYYMMDD
    pub date_of_birth: String,
    pub first_name: String,
    pub last_name: String,
    pub sex: String,
    pub street: String,
    pub house_number: String,
    pub zip_code: String,
    pub city: String,
    pub country: String,
}

impl InsurantRecord {
    /// A record with only the card type set
    pub fn empty(card_type: CardFamily) -> Self {
        Self {
            card_type,
            insurant_id: String::new(),
            date_of_birth: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            sex: String::new(),
            street: String::new(),
            house_number: String::new(),
            zip_code: String::new(),
            city: String::new(),
            country: String::new(),
        }
    }

    pub fn has_address(&self) -> bool {
        [
            &self.street,
            &self.house_number,
            &self.zip_code,
            &self.city,
            &self.country,
        ]
        .iter()
        .any(|field| !field.is_empty())
    }
}

impl fmt::Display for InsurantRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Card type:     {}", self.card_type)?;
        writeln!(f, "Insurant ID:   {}", self.insurant_id)?;
        writeln!(f, "Name:          {} {}", self.first_name, self.last_name)?;
        writeln!(f, "Date of birth: {}", self.date_of_birth)?;
        write!(f, "Sex:           {}", self.sex)?;
        if self.has_address() {
            writeln!(f)?;
            writeln!(f, "Address:       {} {}", self.street, self.house_number)?;
            write!(
                f,
                "               {} {} {}",
                self.zip_code, self.city, self.country
            )?;
        }
        Ok(())
    }
}
