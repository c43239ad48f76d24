//! Macro for defining typed resource identifiers.

/// Defines a string-backed resource identifier with a fixed provider prefix.
///
/// The generated type provides:
/// - A `PREFIX` constant
/// - `generate()` to mint a fresh id (used by in-memory providers)
/// - `parse()` with strict prefix and suffix validation
/// - `Display`, `FromStr`, `Serialize` and `Deserialize`
///
/// # Example
///
/// ```ignore
/// define_resource_id!(InstanceId, "i");
///
/// let id: InstanceId = "i-0a1b2c3d".parse()?;
/// assert_eq!(id.suffix(), "0a1b2c3d");
/// ```
#[macro_export]
macro_rules! define_resource_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The provider prefix for this resource kind.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a new identifier with a random, time-ordered suffix.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!(
                    "{}-{}",
                    Self::PREFIX,
                    $crate::Ulid::new().to_string().to_ascii_lowercase()
                ))
            }

            /// Parses an identifier of the form `{prefix}-{suffix}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, suffix)) = s.split_once('-') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let valid = !suffix.is_empty()
                    && suffix
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
                if !valid {
                    return Err($crate::IdError::InvalidSuffix(suffix.to_string()));
                }

                Ok(Self(s.to_string()))
            }

            /// The full identifier, prefix included.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The provider-assigned part after the prefix.
            #[must_use]
            pub fn suffix(&self) -> &str {
                &self.0[Self::PREFIX.len() + 1..]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
