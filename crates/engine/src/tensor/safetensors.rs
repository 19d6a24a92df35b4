//! SafeTensor header parsing over attached bytes
//!
//! Layout: an 8-byte little-endian header length, a JSON header mapping
//! tensor names to `{dtype, shape, data_offsets}`, then the tensor data.
//! `data_offsets` are relative to the end of the header.

use super::{TensorDType, TensorInfo, TensorMap, TensorMetadataParser};
use patchloop_common::{HotpatchError, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// SafeTensor metadata header
#[derive(Debug, Deserialize)]
struct SafeTensorHeader {
    #[serde(rename = "__metadata__", default)]
    #[allow(dead_code)]
    metadata: Option<HashMap<String, String>>,

    #[serde(flatten)]
    tensors: HashMap<String, RawTensorInfo>,
}

#[derive(Debug, Deserialize)]
struct RawTensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Reads tensor metadata from a SafeTensor-formatted region
#[derive(Debug, Default, Clone, Copy)]
pub struct SafeTensorsParser;

impl TensorMetadataParser for SafeTensorsParser {
    fn parse(&self, region: &[u8]) -> Result<TensorMap> {
        if region.len() < 8 {
            return Err(HotpatchError::Metadata(
                "region too small to contain header".to_string(),
            ));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&region[..8]);
        let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| HotpatchError::Metadata("header length overflows usize".to_string()))?;

        let data_start = 8usize
            .checked_add(header_len)
            .filter(|&end| end <= region.len())
            .ok_or_else(|| {
                HotpatchError::Metadata("header length exceeds region size".to_string())
            })?;

        let header_json = std::str::from_utf8(&region[8..data_start])
            .map_err(|e| HotpatchError::Metadata(format!("invalid UTF-8 in header: {}", e)))?;

        let header: SafeTensorHeader = serde_json::from_str(header_json.trim_end())
            .map_err(|e| HotpatchError::Metadata(format!("failed to parse header JSON: {}", e)))?;

        let mut tensors = TensorMap::new();
        for (name, raw) in header.tensors {
            let [start, end] = raw.data_offsets;
            let in_bounds = data_start
                .checked_add(end)
                .is_some_and(|abs_end| abs_end <= region.len());
            if start > end || !in_bounds {
                return Err(HotpatchError::Metadata(format!(
                    "tensor {} has invalid data offsets [{}, {}]",
                    name, start, end
                )));
            }

            let dtype = TensorDType::parse(&raw.dtype);
            let size = end - start;
            if let Some(elem) = dtype.size() {
                let expected = raw.shape.iter().product::<usize>() * elem;
                if expected != size {
                    return Err(HotpatchError::Metadata(format!(
                        "tensor {} spans {} bytes but shape {:?} needs {}",
                        name, size, raw.shape, expected
                    )));
                }
            }

            tensors.insert(
                name.clone(),
                TensorInfo {
                    name,
                    offset: data_start + start,
                    size,
                    dims: raw.shape,
                    dtype,
                },
            );
        }

        Ok(tensors)
    }
}

/// Build a SafeTensor image from `(name, dtype, shape, data)` entries
pub fn build_safetensors(entries: &[(&str, &str, Vec<usize>, Vec<u8>)]) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, dtype, shape, bytes) in entries {
        let start = data.len();
        data.extend_from_slice(bytes);
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }

    let header_json = serde_json::Value::Object(header).to_string();
    let mut out = Vec::with_capacity(8 + header_json.len() + data.len());
    out.extend_from_slice(&(header_json.len() as u64).to_le_bytes());
    out.extend_from_slice(header_json.as_bytes());
    out.extend_from_slice(&data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_safetensor_parse() {
        let image = build_safetensors(&[
            ("weight", "F32", vec![2, 2], f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
            ("bias", "F32", vec![2], f32_bytes(&[0.5, -0.5])),
        ]);

        let tensors = SafeTensorsParser.parse(&image).unwrap();
        assert_eq!(tensors.len(), 2);

        let weight = &tensors["weight"];
        assert_eq!(weight.dims, vec![2, 2]);
        assert_eq!(weight.dtype, TensorDType::F32);
        assert_eq!(weight.size, 16);
        assert_eq!(
            &image[weight.offset..weight.offset + 4],
            &1.0f32.to_le_bytes()
        );

        let bias = &tensors["bias"];
        assert_eq!(bias.offset, weight.offset + 16);
    }

    #[test]
    fn test_safetensor_rejects_truncated() {
        let mut image = build_safetensors(&[("w", "F32", vec![4], f32_bytes(&[0.0; 4]))]);
        image.truncate(image.len() - 4);
        assert!(SafeTensorsParser.parse(&image).is_err());
        assert!(SafeTensorsParser.parse(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_safetensor_rejects_shape_mismatch() {
        let image = build_safetensors(&[("w", "F32", vec![3], f32_bytes(&[0.0; 4]))]);
        assert!(SafeTensorsParser.parse(&image).is_err());
    }
}
