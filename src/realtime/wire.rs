//! Lenient field decoders for server payloads. Ids and timestamps arrive as
//! either strings or numbers, and any field may be `null`.

use chrono::DateTime;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Flag(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Signed(value) => value.to_string(),
            Self::Unsigned(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Flag(value) => value.to_string(),
        }
    }

    fn into_number(self) -> Option<f64> {
        let number = match self {
            Self::Text(value) => value.trim().parse::<f64>().ok()?,
            Self::Signed(value) => value as f64,
            Self::Unsigned(value) => value as f64,
            Self::Float(value) => value,
            Self::Flag(_) => return None,
        };
        number.is_finite().then_some(number)
    }

    /// Unix milliseconds. Numeric strings count as milliseconds; other strings
    /// must be RFC 3339.
    fn into_unix_ms(self) -> Option<i64> {
        match self {
            Self::Text(value) => {
                let trimmed = value.trim();
                match trimmed.parse::<i64>() {
                    Ok(millis) => Some(millis),
                    Err(_) => DateTime::parse_from_rfc3339(trimmed)
                        .ok()
                        .map(|parsed| parsed.timestamp_millis()),
                }
            }
            Self::Signed(value) => Some(value),
            Self::Unsigned(value) => i64::try_from(value).ok(),
            Self::Float(value) if value.is_finite() => Some(value as i64),
            Self::Float(_) | Self::Flag(_) => None,
        }
    }
}

pub fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(Scalar::into_text)
        .unwrap_or_default())
}

pub fn opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_text))
}

pub fn number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_number(deserializer)?.unwrap_or_default())
}

pub fn opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.and_then(Scalar::into_number))
}

pub fn count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_number(deserializer)?
        .filter(|value| *value >= 0.0)
        .map(|value| value as u64)
        .unwrap_or_default())
}

pub fn opt_unix_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.and_then(Scalar::into_unix_ms))
}

pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "text")]
        id: String,
        #[serde(default, deserialize_with = "opt_number")]
        price: Option<f64>,
        #[serde(default, deserialize_with = "opt_unix_ms")]
        at: Option<i64>,
        #[serde(default, deserialize_with = "null_as_default")]
        tags: Vec<String>,
    }

    fn decode(text: &str) -> Sample {
        let mut payload = text.as_bytes().to_vec();
        simd_json::serde::from_slice(&mut payload).expect("sample should decode")
    }

    #[test]
    fn accepts_numbers_for_text_fields() {
        let sample = decode(r#"{"id":123,"price":"50000.5","at":1700000000000}"#);
        assert_eq!(sample.id, "123");
        assert_eq!(sample.price, Some(50_000.5));
        assert_eq!(sample.at, Some(1_700_000_000_000));
    }

    #[test]
    fn nulls_fall_back_to_defaults() {
        let sample = decode(r#"{"id":null,"price":null,"at":null,"tags":null}"#);
        assert_eq!(sample.id, "");
        assert!(sample.price.is_none());
        assert!(sample.at.is_none());
        assert!(sample.tags.is_empty());
    }

    #[test]
    fn parses_rfc3339_timestamps() {
        let sample = decode(r#"{"id":"a","at":"2026-01-01T00:00:00Z"}"#);
        assert_eq!(sample.at, Some(1_767_225_600_000));

        let unparseable = decode(r#"{"id":"a","at":"yesterday","price":"n/a"}"#);
        assert!(unparseable.at.is_none());
        assert!(unparseable.price.is_none());
    }
}
