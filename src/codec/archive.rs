//! Multi-output archive responses: a zip with one npy entry per declared
//! output name, written in declared order. Entry order is part of the
//! protocol; clients must read entries in archive order, never sorted.

use std::io::{Cursor, Read, Write};

use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::codec::npy;
use crate::error::{Result, ServingError};
use crate::record::NdArray;

/// Encode `(name, array)` pairs into an in-memory zip, preserving order.
pub fn encode_outputs(outputs: &[(String, NdArray)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, array) in outputs {
        writer
            .start_file(name, options)
            .map_err(|e| ServingError::Codec(format!("zip entry '{name}': {e}")))?;
        writer
            .write_all(&npy::encode(array))
            .map_err(|e| ServingError::Codec(format!("zip entry '{name}': {e}")))?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| ServingError::Codec(format!("zip finalize: {e}")))?;
    Ok(cursor.into_inner())
}

/// Decode an archive back into ordered `(name, array)` pairs, reading
/// entries in the order they appear in the archive.
pub fn decode_outputs(bytes: &[u8]) -> Result<Vec<(String, NdArray)>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ServingError::Codec(format!("zip open: {e}")))?;
    let mut outputs = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ServingError::Codec(format!("zip entry {index}: {e}")))?;
        let name = entry.name().to_string();
        let mut payload = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut payload)
            .map_err(|e| ServingError::Codec(format!("zip entry '{name}': {e}")))?;
        outputs.push((name, npy::decode(&payload)?));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_preserves_declared_order() {
        // "scores" before "boxes" even though "boxes" sorts first
        let scores = NdArray::from_f32(vec![1, 3], vec![0.1, 0.2, 0.3]).unwrap();
        let boxes = NdArray::from_f32(vec![1, 2], vec![10.0, 20.0]).unwrap();
        let bytes = encode_outputs(&[
            ("scores".to_string(), scores.clone()),
            ("boxes".to_string(), boxes.clone()),
        ])
        .unwrap();

        let decoded = decode_outputs(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, "scores");
        assert_eq!(decoded[0].1, scores);
        assert_eq!(decoded[1].0, "boxes");
        assert_eq!(decoded[1].1, boxes);
    }

    #[test]
    fn garbage_bytes_are_a_codec_error() {
        let err = decode_outputs(b"definitely not a zip").unwrap_err();
        assert_eq!(err.kind(), "CodecError");
    }
}
