//! Sample encoding shared by configuration, CLI parsing and the player

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How each PCM sample is encoded in the raw stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    /// Two's complement integer samples
    #[default]
    Signed,
    /// Offset-binary integer samples (silence at mid-scale)
    Unsigned,
    /// IEEE 754 floating point samples
    Float,
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleEncoding::Signed => write!(f, "signed"),
            SampleEncoding::Unsigned => write!(f, "unsigned"),
            SampleEncoding::Float => write!(f, "float"),
        }
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signed" | "s" | "int" => Ok(SampleEncoding::Signed),
            "unsigned" | "u" | "uint" => Ok(SampleEncoding::Unsigned),
            "float" | "f" => Ok(SampleEncoding::Float),
            other => Err(format!(
                "unknown sample encoding '{}' (expected signed, unsigned or float)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("signed".parse::<SampleEncoding>().unwrap(), SampleEncoding::Signed);
        assert_eq!("U".parse::<SampleEncoding>().unwrap(), SampleEncoding::Unsigned);
        assert_eq!("Float".parse::<SampleEncoding>().unwrap(), SampleEncoding::Float);
        assert!("ulaw".parse::<SampleEncoding>().is_err());
    }

    #[test]
    fn test_display_matches_serde_name() {
        for encoding in [SampleEncoding::Signed, SampleEncoding::Unsigned, SampleEncoding::Float] {
            let json = serde_json::to_string(&encoding).unwrap();
            assert_eq!(json, format!("\"{}\"", encoding));
        }
    }
}
