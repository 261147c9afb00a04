//! Serde helpers for human-readable durations in configuration files.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::{fmt, time::Duration};

/// Custom serde functions for `Duration` supporting human-readable strings
pub mod duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HumanDurationVisitor;

        impl<'de> Visitor<'de> for HumanDurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a duration as seconds (number) or human-readable string (e.g., '30s', '5m', '1h30m')",
                )
            }

            fn visit_u64<E>(self, seconds: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(seconds))
            }

            // TOML hands integers over as i64.
            fn visit_i64<E>(self, seconds: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(seconds).map(Duration::from_secs).map_err(|_| {
                    de::Error::custom(format!("Duration must not be negative: {seconds}"))
                })
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(value)
                    .map_err(|e| de::Error::custom(format!("cannot parse duration {value:?}: {e}")))
            }
        }

        deserializer.deserialize_any(HumanDurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(with = "super::duration")]
        d: Duration,
    }

    #[test]
    fn accepts_strings_and_seconds() {
        let h: Holder = toml::from_str(r#"d = "1h30m""#).unwrap();
        assert_eq!(h.d, Duration::from_secs(90 * 60));

        let h: Holder = toml::from_str("d = 45").unwrap();
        assert_eq!(h.d, Duration::from_secs(45));
    }

    #[test]
    fn rejects_garbage() {
        assert!(toml::from_str::<Holder>(r#"d = "not-a-duration""#).is_err());
        assert!(toml::from_str::<Holder>("d = -5").is_err());
    }
}
