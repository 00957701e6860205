//! Per-operation option records.
//!
//! Each record enumerates its recognized keys. [`OptionsRecord::from_options`] rejects any other
//! key while the graph is being built, before serde fills defaults.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

pub trait OptionsRecord: DeserializeOwned {
    const OP: &'static str;
    const KEYS: &'static [&'static str];

    /// Extra semantic checks after deserialization.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Parses a JSON object of options; `null` means "all defaults".
    fn from_options(value: serde_json::Value) -> Result<Self> {
        let value = match value {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            serde_json::Value::Object(map) => {
                if let Some(key) = map.keys().find(|key| !Self::KEYS.contains(&key.as_str())) {
                    return Err(GraphError::UnknownOption {
                        op: Self::OP,
                        key: key.clone(),
                        expected: Self::KEYS.join(", "),
                    }
                    .into());
                }
                serde_json::Value::Object(map)
            }
            other => {
                return Err(GraphError::InvalidOptions {
                    op: Self::OP,
                    reason: format!("expected an object, got {other}"),
                }
                .into())
            }
        };
        let record: Self = serde_json::from_value(value).map_err(|err| GraphError::InvalidOptions {
            op: Self::OP,
            reason: err.to_string(),
        })?;
        record.validate()?;
        Ok(record)
    }
}

fn invalid(op: &'static str, reason: impl Into<String>) -> anyhow::Error {
    GraphError::InvalidOptions {
        op,
        reason: reason.into(),
    }
    .into()
}

fn default_rms_epsilon() -> f32 {
    1e-6
}

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

fn default_axis() -> isize {
    -1
}

fn default_true() -> bool {
    true
}

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_init_std() -> f32 {
    0.02
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RmsNormOptions {
    #[serde(default = "default_rms_epsilon")]
    pub epsilon: f32,
    #[serde(default = "default_axis")]
    pub axis: isize,
}

impl Default for RmsNormOptions {
    fn default() -> Self {
        Self {
            epsilon: default_rms_epsilon(),
            axis: default_axis(),
        }
    }
}

impl OptionsRecord for RmsNormOptions {
    const OP: &'static str = "rms_norm";
    const KEYS: &'static [&'static str] = &["epsilon", "axis"];

    fn validate(&self) -> Result<()> {
        if !(self.epsilon >= 0.0) {
            return Err(invalid(Self::OP, "epsilon must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerNormOptions {
    #[serde(default = "default_layer_norm_epsilon")]
    pub epsilon: f32,
    #[serde(default = "default_axis")]
    pub axis: isize,
    #[serde(default = "default_true")]
    pub center: bool,
}

impl Default for LayerNormOptions {
    fn default() -> Self {
        Self {
            epsilon: default_layer_norm_epsilon(),
            axis: default_axis(),
            center: true,
        }
    }
}

impl OptionsRecord for LayerNormOptions {
    const OP: &'static str = "layer_norm";
    const KEYS: &'static [&'static str] = &["epsilon", "axis", "center"];

    fn validate(&self) -> Result<()> {
        if !(self.epsilon >= 0.0) {
            return Err(invalid(Self::OP, "epsilon must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropPathOptions {
    #[serde(default)]
    pub rate: f32,
    #[serde(default)]
    pub seed: i32,
}

impl OptionsRecord for DropPathOptions {
    const OP: &'static str = "drop_path";
    const KEYS: &'static [&'static str] = &["rate", "seed"];

    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.rate) {
            return Err(invalid(Self::OP, format!("rate {} not in [0, 1)", self.rate)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelativePositionOptions {
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub max_distance: usize,
    #[serde(default = "default_true")]
    pub bidirectional: bool,
}

impl RelativePositionOptions {
    pub fn new(num_heads: usize) -> Self {
        Self {
            num_heads,
            num_buckets: default_num_buckets(),
            max_distance: default_max_distance(),
            bidirectional: true,
        }
    }
}

impl OptionsRecord for RelativePositionOptions {
    const OP: &'static str = "relative_position_bias";
    const KEYS: &'static [&'static str] =
        &["num_heads", "num_buckets", "max_distance", "bidirectional"];

    fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(invalid(Self::OP, "num_heads must be positive"));
        }
        let budget = if self.bidirectional {
            self.num_buckets / 2
        } else {
            self.num_buckets
        };
        let max_exact = budget / 2;
        if max_exact == 0 {
            return Err(invalid(
                Self::OP,
                format!("num_buckets {} leaves no exact buckets", self.num_buckets),
            ));
        }
        if self.max_distance <= max_exact {
            return Err(invalid(
                Self::OP,
                format!(
                    "max_distance {} must exceed the exact range {max_exact}",
                    self.max_distance
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenseOptions {
    pub units: usize,
    #[serde(default = "default_true")]
    pub use_bias: bool,
    #[serde(default = "default_init_std")]
    pub init_std: f32,
}

impl DenseOptions {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            use_bias: true,
            init_std: default_init_std(),
        }
    }
}

impl OptionsRecord for DenseOptions {
    const OP: &'static str = "dense";
    const KEYS: &'static [&'static str] = &["units", "use_bias", "init_std"];

    fn validate(&self) -> Result<()> {
        if self.units == 0 {
            return Err(invalid(Self::OP, "units must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttentionOptions {
    pub num_heads: usize,
    /// Per-head depth; defaults to `hidden / num_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_true")]
    pub scale_query: bool,
    #[serde(default = "default_true")]
    pub use_bias: bool,
    #[serde(default)]
    pub relative_position: Option<RelativePositionOptions>,
    #[serde(default)]
    pub output_weights: bool,
    #[serde(default = "default_init_std")]
    pub init_std: f32,
}

impl AttentionOptions {
    pub fn new(num_heads: usize) -> Self {
        Self {
            num_heads,
            head_dim: None,
            scale_query: true,
            use_bias: true,
            relative_position: None,
            output_weights: false,
            init_std: default_init_std(),
        }
    }
}

impl OptionsRecord for AttentionOptions {
    const OP: &'static str = "attention";
    const KEYS: &'static [&'static str] = &[
        "num_heads",
        "head_dim",
        "scale_query",
        "use_bias",
        "relative_position",
        "output_weights",
        "init_std",
    ];

    fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(invalid(Self::OP, "num_heads must be positive"));
        }
        if self.head_dim == Some(0) {
            return Err(invalid(Self::OP, "head_dim must be positive"));
        }
        if let Some(relative) = &self.relative_position {
            if relative.num_heads != self.num_heads {
                return Err(invalid(
                    Self::OP,
                    "relative_position.num_heads must match num_heads",
                ));
            }
            relative.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_fail_with_their_name() {
        let err = RmsNormOptions::from_options(json!({"epsilon": 1e-5, "eps": 1e-5})).unwrap_err();
        match err.downcast_ref::<GraphError>() {
            Some(GraphError::UnknownOption { op, key, .. }) => {
                assert_eq!(*op, "rms_norm");
                assert_eq!(key, "eps");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn null_yields_defaults() {
        let options = RmsNormOptions::from_options(serde_json::Value::Null).unwrap();
        assert_eq!(options, RmsNormOptions::default());
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let err = DenseOptions::from_options(json!({"use_bias": false})).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::InvalidOptions { op: "dense", .. })
        ));
    }

    #[test]
    fn nested_relative_options_are_validated() {
        let err = AttentionOptions::from_options(json!({
            "num_heads": 4,
            "relative_position": {"num_heads": 4, "num_buckets": 2}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("exact"));
    }

    #[test]
    fn drop_path_rate_must_be_below_one() {
        assert!(DropPathOptions::from_options(json!({"rate": 1.0})).is_err());
        assert_eq!(
            DropPathOptions::from_options(json!({"rate": 0.1})).unwrap().rate,
            0.1
        );
    }
}
