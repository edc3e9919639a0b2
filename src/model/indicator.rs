//! Indicator definitions as declared in deployment configuration.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::druid::Granularity;

/// How a raw indicator's value is aggregated.
///
/// Unrecognized names deserialize to [`IndicatorType::Unknown`] so that one
/// bad definition does not reject a whole config file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndicatorType {
    #[default]
    Sum,
    Max,
    Average,
    Stock,
    WeightedAvg,
    ThetaSketchUniqueCount,
    Composite,
    Unknown(String),
}

impl IndicatorType {
    pub fn as_str(&self) -> &str {
        match self {
            IndicatorType::Sum => "SUM",
            IndicatorType::Max => "MAX",
            IndicatorType::Average => "AVERAGE",
            IndicatorType::Stock => "STOCK",
            IndicatorType::WeightedAvg => "WEIGHTED_AVG",
            IndicatorType::ThetaSketchUniqueCount => "THETA_SKETCH_UNIQUE_COUNT",
            IndicatorType::Composite => "COMPOSITE",
            IndicatorType::Unknown(name) => name,
        }
    }
}

impl From<String> for IndicatorType {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "SUM" => IndicatorType::Sum,
            "MAX" => IndicatorType::Max,
            "AVERAGE" | "AVG" => IndicatorType::Average,
            "STOCK" => IndicatorType::Stock,
            "WEIGHTED_AVG" | "WEIGHTED_AVERAGE" => IndicatorType::WeightedAvg,
            "THETA_SKETCH_UNIQUE_COUNT" => IndicatorType::ThetaSketchUniqueCount,
            "COMPOSITE" => IndicatorType::Composite,
            _ => IndicatorType::Unknown(value),
        }
    }
}

impl From<IndicatorType> for String {
    fn from(value: IndicatorType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refinement of AVERAGE and STOCK semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndicatorSubtype {
    /// AVERAGE: divide by the number of elapsed report days.
    TimeBucket,
    /// STOCK: read the value from the last bucket of the queried interval.
    LastBucket,
    Unknown(String),
}

impl IndicatorSubtype {
    pub fn as_str(&self) -> &str {
        match self {
            IndicatorSubtype::TimeBucket => "TIME_BUCKET",
            IndicatorSubtype::LastBucket => "LAST_BUCKET",
            IndicatorSubtype::Unknown(name) => name,
        }
    }
}

impl From<String> for IndicatorSubtype {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "TIME_BUCKET" => IndicatorSubtype::TimeBucket,
            "LAST_BUCKET" => IndicatorSubtype::LastBucket,
            _ => IndicatorSubtype::Unknown(value),
        }
    }
}

impl From<IndicatorSubtype> for String {
    fn from(value: IndicatorSubtype) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IndicatorSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One indicator entry of a group: raw, calculated (has a `formula`) or
/// composite (`type = COMPOSITE` with `children`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub indicator_type: Option<IndicatorType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<IndicatorSubtype>,

    /// Arithmetic formula over other indicator IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Display hint such as `PERCENT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    #[serde(default)]
    pub hide_constituents: bool,

    /// WEIGHTED_AVG: field holding the weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_field: Option<String>,

    /// STOCK: bucket size used for edge-bucket resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_granularity: Option<Granularity>,

    /// THETA_SKETCH_UNIQUE_COUNT: dimension whose distinct values are counted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theta_sketch_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theta_sketch_size: Option<u32>,

    /// THETA_SKETCH_UNIQUE_COUNT: restrict counted rows to this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_field: Option<String>,

    /// COMPOSITE: indicators summed to produce this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl IndicatorDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, indicator_type: IndicatorType) -> Self {
        self.indicator_type = Some(indicator_type);
        self
    }

    pub fn with_subtype(mut self, subtype: IndicatorSubtype) -> Self {
        self.subtype = Some(subtype);
        self
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indicator_type = Some(IndicatorType::Composite);
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    /// Declared type, SUM when absent.
    pub fn indicator_type(&self) -> Cow<'_, IndicatorType> {
        match &self.indicator_type {
            Some(t) => Cow::Borrowed(t),
            None => Cow::Owned(IndicatorType::Sum),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.indicator_type, Some(IndicatorType::Composite))
    }

    /// Calculated indicators are compiled from other indicators rather than
    /// read from raw data.
    pub fn is_calculated(&self) -> bool {
        self.formula.is_some() || self.is_composite()
    }

    /// The formula to compile for a calculated indicator.
    ///
    /// Composites with children use the sum of their children; a composite
    /// without children falls back to an explicit `formula`.
    pub fn effective_formula(&self) -> Option<Cow<'_, str>> {
        if self.is_composite() && !self.children.is_empty() {
            return Some(Cow::Owned(self.children.join(" + ")));
        }
        self.formula.as_deref().map(Cow::Borrowed)
    }
}

/// A named group of indicators, as shown in the query UI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorGroup {
    #[serde(rename = "groupId")]
    pub group_id: String,

    #[serde(rename = "groupText", default)]
    pub group_text: String,

    #[serde(default)]
    pub indicators: Vec<IndicatorDefinition>,
}

impl IndicatorGroup {
    pub fn new(group_id: impl Into<String>, indicators: Vec<IndicatorDefinition>) -> Self {
        Self {
            group_id: group_id.into(),
            group_text: String::new(),
            indicators,
        }
    }
}
