//! Property metadata as reported by the acquisition subsystem.
//!
//! Property values are a closed set of variants. Each variant has exactly one
//! persisted representation, chosen once when the hardware spec is generated.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// Floating point or generic numeric.
    Double,
    /// Integer numeric.
    Integer,
    /// Text or enumerated text.
    String,
    /// Boolean flag.
    Boolean,
    /// Function handle / callback.
    Callback,
    /// Nested record.
    Struct,
    /// Anything else.
    Any,
}

/// Kind of constraint applied to a property's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    /// Unconstrained.
    None,
    /// Numeric value within `[min, max]`.
    Bounded,
    /// One of a fixed list of names.
    Enum,
    /// Must be a callback reference.
    Callback,
    /// Non-negative numeric.
    ZeroOrPositive,
    /// Strictly positive numeric.
    Positive,
    /// Integral numeric.
    Integer,
}

/// A property value in its persisted, closed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Single number. Non-finite values are stored as text markers.
    NumericScalar(#[serde(with = "exact_float")] f64),
    /// Fixed-length numeric array such as an ROI position.
    NumericArray(#[serde(with = "exact_floats")] Vec<f64>),
    /// Free text.
    Text(String),
    /// Ordered set of enumerated names.
    EnumList(Vec<String>),
    /// Boolean flag.
    Boolean(bool),
    /// Symbolic reference to a callback, by name only.
    CallbackRef(String),
    /// Nested record with named fields.
    NestedRecord(BTreeMap<String, PropertyValue>),
    /// Placeholder for an object that cannot be persisted, by class name.
    OpaqueRef(String),
}

impl PropertyValue {
    /// Normalize a raw value into its canonical variant.
    ///
    /// Single-element arrays collapse to scalars; nested records are normalized
    /// recursively.
    #[must_use]
    pub fn classify(self) -> Self {
        match self {
            Self::NumericArray(values) if values.len() == 1 => {
                values.first().copied().map_or(Self::NumericArray(Vec::new()), Self::NumericScalar)
            }
            Self::NestedRecord(fields) => Self::NestedRecord(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, value.classify()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Short variant label used in reports.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NumericScalar(_) => "numeric",
            Self::NumericArray(_) => "numeric-array",
            Self::Text(_) => "text",
            Self::EnumList(_) => "enum-list",
            Self::Boolean(_) => "boolean",
            Self::CallbackRef(_) => "callback",
            Self::NestedRecord(_) => "record",
            Self::OpaqueRef(_) => "opaque",
        }
    }

    /// Compare two values, treating NaN as equal to NaN.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NumericScalar(a), Self::NumericScalar(b)) => floats_same(*a, *b),
            (Self::NumericArray(a), Self::NumericArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| floats_same(*x, *y))
            }
            (Self::NestedRecord(a), Self::NestedRecord(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_as(vb))
            }
            _ => self == other,
        }
    }
}

#[allow(clippy::float_cmp)]
fn floats_same(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumericScalar(v) => write!(f, "{v:?}"),
            Self::NumericArray(vs) => write!(f, "{vs:?}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::EnumList(items) => write!(f, "{{{}}}", items.join(", ")),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::CallbackRef(name) => write!(f, "@{name}"),
            Self::NestedRecord(fields) => {
                write!(f, "struct(")?;
                for (idx, (name, value)) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}={value}")?;
                }
                write!(f, ")")
            }
            Self::OpaqueRef(class) => write!(f, "<{class}>"),
        }
    }
}

/// Metadata of one property exposed by a session or its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// Declared type.
    pub property_type: PropertyType,
    /// Constraint kind.
    pub constraint: ConstraintKind,
    /// Constraint payload (bounds, enum names, ...), if any.
    pub constraint_value: Option<PropertyValue>,
    /// Default value.
    pub default_value: PropertyValue,
    /// Whether the property can be written.
    pub read_only: bool,
    /// Whether the property is specific to this device (not part of the common set).
    pub device_specific: bool,
}

/// An `f64` that serializes non-finite values as text markers.
#[derive(Clone, Copy)]
struct Exact(f64);

impl Serialize for Exact {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.0;
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("Inf")
        } else {
            serializer.serialize_str("-Inf")
        }
    }
}

impl<'de> Deserialize<'de> for Exact {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Marker(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(Self(value)),
            Repr::Marker(marker) => match marker.as_str() {
                "NaN" => Ok(Self(f64::NAN)),
                "Inf" => Ok(Self(f64::INFINITY)),
                "-Inf" => Ok(Self(f64::NEG_INFINITY)),
                other => Err(serde::de::Error::custom(format!(
                    "invalid numeric marker `{other}`"
                ))),
            },
        }
    }
}

mod exact_float {
    use super::Exact;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        Exact(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Exact::deserialize(deserializer).map(|exact| exact.0)
    }
}

mod exact_floats {
    use super::Exact;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(values: &Vec<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|value| Exact(*value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Exact>::deserialize(deserializer)
            .map(|values| values.into_iter().map(|exact| exact.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_collapses_single_element_array() {
        let value = PropertyValue::NumericArray(vec![2.5]).classify();
        assert_eq!(value, PropertyValue::NumericScalar(2.5));

        let roi = PropertyValue::NumericArray(vec![0.0, 0.0, 640.0, 480.0]).classify();
        assert_eq!(roi.kind(), "numeric-array");
    }

    #[test]
    fn test_scalar_keeps_full_precision() {
        let value = PropertyValue::NumericScalar(1.000_000_000_000_000_2);
        let json = serde_json::to_string(&value).expect("serialize failed");
        let back: PropertyValue = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(back, value);
        assert_ne!(back, PropertyValue::NumericScalar(1.0));
    }

    #[test]
    fn test_non_finite_values_survive() {
        let value = PropertyValue::NumericArray(vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY]);
        let json = serde_json::to_string(&value).expect("serialize failed");
        assert!(json.contains("\"NaN\""));
        let back: PropertyValue = serde_json::from_str(&json).expect("deserialize failed");
        assert!(back.same_as(&value));
    }

    #[test]
    fn test_callback_persists_name_only() {
        let value = PropertyValue::CallbackRef("onFrameAcquired".to_owned());
        let json = serde_json::to_string(&value).expect("serialize failed");
        assert_eq!(json, r#"{"kind":"callback_ref","value":"onFrameAcquired"}"#);
        assert_eq!(value.to_string(), "@onFrameAcquired");
    }

    #[test]
    fn test_nested_record_display() {
        let mut fields = BTreeMap::new();
        fields.insert("Gain".to_owned(), PropertyValue::NumericScalar(1.5));
        fields.insert("Mode".to_owned(), PropertyValue::Text("Auto".to_owned()));
        let value = PropertyValue::NestedRecord(fields);
        assert_eq!(value.to_string(), "struct(Gain=1.5, Mode='Auto')");
    }
}
