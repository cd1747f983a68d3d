//! RGB color values for overlay configuration.

use serde::{Deserialize, Serialize};

/// An RGB color parsed from `R,G,B` or `0xRRGGBB` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const RED: Rgb = Rgb::new(255, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl std::str::FromStr for Rgb {
    type Err = ColorParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if let Some(hex) = input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
            let value = u32::from_str_radix(hex, 16)
                .map_err(|_| ColorParseError(input.to_string()))?;
            if value > 0xFFFFFF {
                return Err(ColorParseError(input.to_string()));
            }
            return Ok(Rgb::new(
                ((value >> 16) & 0xFF) as u8,
                ((value >> 8) & 0xFF) as u8,
                (value & 0xFF) as u8,
            ));
        }
        let stripped = input
            .trim_start_matches('(')
            .trim_end_matches(')')
            .replace(' ', "");
        let parts: Vec<&str> = stripped.split(',').collect();
        if parts.len() != 3 {
            return Err(ColorParseError(input.to_string()));
        }
        let channel = |s: &str| {
            s.parse::<u8>()
                .map_err(|_| ColorParseError(input.to_string()))
        };
        Ok(Rgb::new(channel(parts[0])?, channel(parts[1])?, channel(parts[2])?))
    }
}

impl std::fmt::Display for Rgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Color value that could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorParseError(pub String);

impl std::fmt::Display for ColorParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "color values must be hex (0xFFFFFF) or R,G,B (255,255,255), got '{}'",
            self.0
        )
    }
}

impl std::error::Error for ColorParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!("0xFF0000".parse::<Rgb>().unwrap(), Rgb::RED);
        assert_eq!("0x00ff7f".parse::<Rgb>().unwrap(), Rgb::new(0, 255, 127));
    }

    #[test]
    fn test_parse_triple() {
        assert_eq!("255,255,255".parse::<Rgb>().unwrap(), Rgb::WHITE);
        assert_eq!("(0, 128, 255)".parse::<Rgb>().unwrap(), Rgb::new(0, 128, 255));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!("".parse::<Rgb>().is_err());
        assert!("0x1234567".parse::<Rgb>().is_err());
        assert!("1,2".parse::<Rgb>().is_err());
        assert!("256,0,0".parse::<Rgb>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let c = Rgb::new(18, 52, 86);
        assert_eq!(c.to_string().parse::<Rgb>().unwrap(), c);
    }
}
