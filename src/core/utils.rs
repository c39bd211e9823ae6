use anyhow::{bail, Context, Result};

/// Parse a hex string into bytes
/// Supports various formats:
/// - "3BD396FF" (pure hex)
/// - "3B D3 96 FF" (space-separated, as printed by most PCSC tools)
/// - "0x3B,0xD3,0x96,0xFF" (0x prefix with commas)
/// - "3B:D3:96:FF" (colon-separated)
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = clean_hex_string(hex_str);

    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    if cleaned.len() % 2 != 0 {
        bail!(
            "Hex string must have even number of characters: '{}'",
            hex_str
        );
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{hex_str}'"))
}

/// Clean a hex string by removing common separators and prefixes
fn clean_hex_string(hex_str: &str) -> String {
    hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .replace([' ', ',', ':', '-', '\t', '\n', '\r'], "")
        .to_uppercase()
}

/// Format bytes as a hex string
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Format bytes as a hex string with spaces
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Get a human-readable description of SW1/SW2 status words
pub fn describe_status_word(sw1: u8, sw2: u8) -> String {
    match (sw1, sw2) {
        (0x90, 0x00) => "Success".to_string(),
        (0x61, n) => format!("Success, {n} bytes available"),
        (0x62, 0x00) => "Warning: No information given".to_string(),
        (0x62, 0x81) => "Warning: Part of returned data may be corrupted".to_string(),
        (0x62, 0x82) => "Warning: End of file reached".to_string(),
        (0x62, 0x83) => "Warning: Selected file invalidated".to_string(),
        (0x62, 0x84) => "Warning: FCI not formatted".to_string(),
        (0x63, n) if n & 0xF0 == 0xC0 => format!("Warning: Counter = {}", n & 0x0F),
        (0x64, 0x00) => "Error: Execution error".to_string(),
        (0x65, 0x81) => "Error: Memory failure".to_string(),
        (0x67, 0x00) => "Error: Wrong length".to_string(),
        (0x68, 0x82) => "Error: Secure messaging not supported".to_string(),
        (0x69, 0x81) => "Error: Command incompatible with file structure".to_string(),
        (0x69, 0x82) => "Error: Security status not satisfied".to_string(),
        (0x69, 0x85) => "Error: Conditions of use not satisfied".to_string(),
        (0x69, 0x86) => "Error: Command not allowed (no current EF)".to_string(),
        (0x6A, 0x81) => "Error: Function not supported".to_string(),
        (0x6A, 0x82) => "Error: File not found".to_string(),
        (0x6A, 0x86) => "Error: Incorrect parameters P1-P2".to_string(),
        (0x6A, 0x88) => "Error: Referenced data not found".to_string(),
        (0x6B, 0x00) => "Error: Offset outside of file".to_string(),
        (0x6C, n) => format!("Error: Wrong Le field, exact length: {n}"),
        (0x6D, 0x00) => "Error: Instruction code not supported or invalid".to_string(),
        (0x6E, 0x00) => "Error: Class not supported".to_string(),
        (0x6F, 0x00) => "Error: No precise diagnosis".to_string(),
        _ => format!("Unknown status: {sw1:02X} {sw2:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_various_formats() {
        assert_eq!(parse_hex("3BD396FF").unwrap(), vec![0x3B, 0xD3, 0x96, 0xFF]);
        assert_eq!(
            parse_hex("3B D3 96 FF").unwrap(),
            vec![0x3B, 0xD3, 0x96, 0xFF]
        );
        assert_eq!(
            parse_hex("0x3B,0xD3,0x96,0xFF").unwrap(),
            vec![0x3B, 0xD3, 0x96, 0xFF]
        );
        assert_eq!(
            parse_hex("3b:d3:96:ff").unwrap(),
            vec![0x3B, 0xD3, 0x96, 0xFF]
        );
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_hex("   ").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_hex("\t90\n00\r").unwrap(), vec![0x90, 0x00]);
    }

    #[test]
    fn test_parse_hex_invalid() {
        assert!(parse_hex("900").is_err()); // Odd length
        assert!(parse_hex("9G00").is_err()); // Invalid hex character
        assert!(parse_hex("Z").is_err());
    }

    #[test]
    fn test_format_functions() {
        let bytes = vec![0x00, 0xB0, 0x81, 0x00, 0x02];
        assert_eq!(format_hex(&bytes), "00B0810002");
        assert_eq!(format_hex_spaced(&bytes), "00 B0 81 00 02");

        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex_spaced(&[]), "");
    }

    #[test]
    fn test_describe_status_word() {
        assert_eq!(describe_status_word(0x90, 0x00), "Success");
        assert_eq!(
            describe_status_word(0x62, 0x82),
            "Warning: End of file reached"
        );
        assert_eq!(
            describe_status_word(0x6B, 0x00),
            "Error: Offset outside of file"
        );
        assert_eq!(describe_status_word(0x6A, 0x82), "Error: File not found");
        assert_eq!(describe_status_word(0x63, 0xC3), "Warning: Counter = 3");
        assert_eq!(describe_status_word(0x12, 0x34), "Unknown status: 12 34");
    }

    #[test]
    fn test_clean_hex_string() {
        assert_eq!(clean_hex_string("0x01,0x02"), "0102");
        assert_eq!(clean_hex_string("3b d3 96"), "3BD396");
        assert_eq!(clean_hex_string("  0X01  "), "01");
    }
}
