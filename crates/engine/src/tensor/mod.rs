//! Tensor metadata collaborators
//!
//! The memory engine does not understand model file formats. At attach time it
//! asks a [`TensorMetadataParser`] for a name → [`TensorInfo`] map covering the
//! attached bytes and keeps that map immutable until detach.

pub mod safetensors;

pub use safetensors::SafeTensorsParser;

use patchloop_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorDType {
    /// Float32
    F32,
    /// Float16
    F16,
    /// BFloat16
    BF16,
    /// Int32
    I32,
    /// Int8
    I8,
    /// UInt8
    U8,
    /// Block-quantized format, by name (e.g. "Q4_0")
    Quantized(String),
}

impl TensorDType {
    /// Size in bytes of one element, if the type has fixed-width elements
    pub fn size(&self) -> Option<usize> {
        match self {
            TensorDType::F32 | TensorDType::I32 => Some(4),
            TensorDType::F16 | TensorDType::BF16 => Some(2),
            TensorDType::I8 | TensorDType::U8 => Some(1),
            TensorDType::Quantized(_) => None,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Self {
        match s {
            "F32" => TensorDType::F32,
            "F16" => TensorDType::F16,
            "BF16" => TensorDType::BF16,
            "I32" => TensorDType::I32,
            "I8" => TensorDType::I8,
            "U8" | "BOOL" => TensorDType::U8,
            other => TensorDType::Quantized(other.to_string()),
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &str {
        match self {
            TensorDType::F32 => "F32",
            TensorDType::F16 => "F16",
            TensorDType::BF16 => "BF16",
            TensorDType::I32 => "I32",
            TensorDType::I8 => "I8",
            TensorDType::U8 => "U8",
            TensorDType::Quantized(name) => name,
        }
    }
}

/// Location and shape of one tensor inside the attached region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    /// Absolute offset from the start of the region
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
    pub dims: Vec<usize>,
    pub dtype: TensorDType,
}

impl TensorInfo {
    /// Number of elements
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tensors keyed by name
pub type TensorMap = BTreeMap<String, TensorInfo>;

/// Produces tensor metadata for an attached region
pub trait TensorMetadataParser: Send + Sync {
    /// Describe the tensors in `region`; failure aborts the attach
    fn parse(&self, region: &[u8]) -> Result<TensorMap>;
}

impl<F> TensorMetadataParser for F
where
    F: Fn(&[u8]) -> Result<TensorMap> + Send + Sync,
{
    fn parse(&self, region: &[u8]) -> Result<TensorMap> {
        self(region)
    }
}

/// Parser for regions without tensor metadata
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTensorMetadata;

impl TensorMetadataParser for NoTensorMetadata {
    fn parse(&self, _region: &[u8]) -> Result<TensorMap> {
        Ok(TensorMap::new())
    }
}

/// Tensor names of transformer block `index` that feed the residual stream
pub fn residual_projections(index: usize) -> [String; 2] {
    [
        format!("blk.{}.attn_output.weight", index),
        format!("blk.{}.ffn_down.weight", index),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchloop_common::HotpatchError;

    #[test]
    fn test_dtype_parse() {
        assert_eq!(TensorDType::parse("F16"), TensorDType::F16);
        assert_eq!(TensorDType::parse("F16").size(), Some(2));
        let q = TensorDType::parse("Q4_0");
        assert_eq!(q.size(), None);
        assert_eq!(q.as_str(), "Q4_0");
    }

    #[test]
    fn test_closure_parser() {
        let parser = |region: &[u8]| -> Result<TensorMap> {
            if region.is_empty() {
                return Err(HotpatchError::Metadata("empty".into()));
            }
            Ok(TensorMap::new())
        };
        assert!(parser.parse(&[]).is_err());
        assert!(parser.parse(&[1]).unwrap().is_empty());
        assert!(NoTensorMetadata.parse(&[]).unwrap().is_empty());
    }
}
