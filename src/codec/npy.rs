//! NPY v1.0 encoding and decoding for [`NdArray`] values.
//!
//! The format is self-describing: a fixed magic, a python-dict header
//! carrying dtype descriptor, memory order, and shape, then the raw
//! little-endian element buffer. Only C-order (row-major) arrays are
//! supported; fortran-order payloads are rejected.

use crate::error::{Result, ServingError};
use crate::record::{DType, NdArray};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

fn descr(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "<f4",
        DType::F64 => "<f8",
        DType::I64 => "<i8",
    }
}

fn dtype_for_descr(s: &str) -> Result<DType> {
    match s {
        "<f4" | "|f4" => Ok(DType::F32),
        "<f8" | "|f8" => Ok(DType::F64),
        "<i8" | "|i8" => Ok(DType::I64),
        other => Err(ServingError::Codec(format!(
            "unsupported npy dtype descriptor '{other}'"
        ))),
    }
}

fn shape_literal(shape: &[usize]) -> String {
    // numpy writes 1-tuples with a trailing comma
    match shape.len() {
        1 => format!("({},)", shape[0]),
        _ => format!(
            "({})",
            shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Encode an array as NPY v1.0 bytes.
pub fn encode(array: &NdArray) -> Vec<u8> {
    let header_dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr(array.dtype),
        shape_literal(&array.shape)
    );
    // Pad the header so the data section starts on a 64-byte boundary.
    let unpadded = MAGIC.len() + 2 + 2 + header_dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = (header_dict.len() + padding + 1) as u16;

    let mut out = Vec::with_capacity(
        MAGIC.len() + 4 + header_len as usize + array.element_count() * array.dtype.size_bytes(),
    );
    out.extend_from_slice(MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(header_dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');

    match array.dtype {
        DType::F32 => {
            for v in array.as_f32().unwrap_or(&[]) {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        DType::F64 => {
            for v in array.as_f64().unwrap_or(&[]) {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        DType::I64 => {
            for v in array.as_i64().unwrap_or(&[]) {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    out
}

/// Decode NPY v1.0/v2.0 bytes into an [`NdArray`].
pub fn decode(bytes: &[u8]) -> Result<NdArray> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(ServingError::Codec(
            "payload is not an npy array (bad magic)".to_string(),
        ));
    }
    let (major, _minor) = (bytes[6], bytes[7]);
    let (header_len, header_start) = match major {
        1 => (
            u16::from_le_bytes([bytes[8], bytes[9]]) as usize,
            10usize,
        ),
        2 => {
            if bytes.len() < 12 {
                return Err(ServingError::Codec("truncated npy v2 header".to_string()));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12usize,
            )
        }
        other => {
            return Err(ServingError::Codec(format!(
                "unsupported npy format version {other}"
            )))
        }
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(ServingError::Codec("truncated npy header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|e| ServingError::Codec(format!("npy header is not utf-8: {e}")))?;

    let descr = extract_quoted(header, "descr")?;
    let dtype = dtype_for_descr(&descr)?;
    if header.contains("'fortran_order': True") {
        return Err(ServingError::Codec(
            "fortran-order npy arrays are not supported".to_string(),
        ));
    }
    let shape = extract_shape(header)?;

    let expected: usize = shape.iter().product::<usize>() * dtype.size_bytes();
    let data = &bytes[data_start..];
    if data.len() < expected {
        return Err(ServingError::Codec(format!(
            "npy data section has {} bytes, shape {shape:?} needs {expected}",
            data.len()
        )));
    }
    let data = &data[..expected];

    match dtype {
        DType::F32 => NdArray::from_f32(
            shape,
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DType::F64 => NdArray::from_f64(
            shape,
            data.chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
        ),
        DType::I64 => NdArray::from_i64(
            shape,
            data.chunks_exact(8)
                .map(|c| {
                    i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
        ),
    }
}

fn extract_quoted(header: &str, key: &str) -> Result<String> {
    let marker = format!("'{key}':");
    let idx = header
        .find(&marker)
        .ok_or_else(|| ServingError::Codec(format!("npy header missing '{key}'")))?;
    let rest = &header[idx + marker.len()..];
    let open = rest
        .find('\'')
        .ok_or_else(|| ServingError::Codec(format!("malformed '{key}' in npy header")))?;
    let rest = &rest[open + 1..];
    let close = rest
        .find('\'')
        .ok_or_else(|| ServingError::Codec(format!("malformed '{key}' in npy header")))?;
    Ok(rest[..close].to_string())
}

fn extract_shape(header: &str) -> Result<Vec<usize>> {
    let idx = header
        .find("'shape':")
        .ok_or_else(|| ServingError::Codec("npy header missing 'shape'".to_string()))?;
    let rest = &header[idx + "'shape':".len()..];
    let open = rest
        .find('(')
        .ok_or_else(|| ServingError::Codec("malformed shape in npy header".to_string()))?;
    let close = rest
        .find(')')
        .ok_or_else(|| ServingError::Codec("malformed shape in npy header".to_string()))?;
    let inner = &rest[open + 1..close];
    let mut shape = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let dim: usize = part.parse().map_err(|_| {
            ServingError::Codec(format!("non-numeric shape dimension '{part}'"))
        })?;
        shape.push(dim);
    }
    if shape.is_empty() {
        // scalar array: treat as a single element
        shape.push(1);
    }
    Ok(shape)
}
