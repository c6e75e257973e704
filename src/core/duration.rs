//! Serde adapters that store `Duration`s as integer milliseconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

pub mod option_millis {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "super::millis")]
        delay: Duration,
        #[serde(default, with = "super::option_millis")]
        timeout: Option<Duration>,
    }

    #[test]
    fn test_millis_fields() {
        let parsed: Timed = serde_json::from_str(r#"{"delay": 250}"#).unwrap();
        assert_eq!(parsed.delay, Duration::from_millis(250));
        assert_eq!(parsed.timeout, None);

        let json = serde_json::to_value(&Timed {
            delay: Duration::from_secs(1),
            timeout: Some(Duration::from_millis(50)),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"delay": 1000, "timeout": 50}));
    }
}
