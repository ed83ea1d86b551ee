//! Minimal NPY v1.0 reader/writer for little-endian float32 volumes.
//!
//! Covers exactly the subset the travel-time volumes need: C-ordered
//! 3-D `<f4` arrays. The header is padded so the payload starts 64-byte
//! aligned, as the format requires.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{QSeekError, Result};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Write a 3-D float32 array in NPY v1.0 format.
pub fn write_npy_f32<W: Write>(writer: &mut W, shape: [usize; 3], data: &[f32]) -> Result<()> {
    if data.len() != shape[0] * shape[1] * shape[2] {
        return Err(QSeekError::table(format!(
            "volume data length {} does not match shape {shape:?}",
            data.len()
        )));
    }

    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}, {}), }}",
        shape[0], shape[1], shape[2]
    )
    .into_bytes();
    // Pad with spaces so magic + version + length + header is a multiple
    // of 64 bytes, terminated by a newline.
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.resize(header.len() + padding, b' ');
    header.push(b'\n');

    writer.write_all(MAGIC)?;
    writer.write_all(&[0x01, 0x00])?;
    writer.write_u16::<LittleEndian>(header.len() as u16)?;
    writer.write_all(&header)?;
    for &value in data {
        writer.write_f32::<LittleEndian>(value)?;
    }
    Ok(())
}

/// Read a 3-D float32 array in NPY format, returning `(shape, data)`.
pub fn read_npy_f32<R: Read>(reader: &mut R) -> Result<([usize; 3], Vec<f32>)> {
    let mut magic = [0_u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(QSeekError::table("not an NPY file"));
    }
    let mut version = [0_u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        other => {
            return Err(QSeekError::table(format!("unsupported NPY version {other}")));
        }
    };

    let mut header = vec![0_u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    if !header.contains("'<f4'") {
        return Err(QSeekError::table(format!(
            "unsupported NPY dtype in header: {header}"
        )));
    }
    if header.contains("'fortran_order': True") {
        return Err(QSeekError::table("fortran-ordered NPY volumes are not supported"));
    }
    let shape = parse_shape(&header)?;

    let n_values = shape[0] * shape[1] * shape[2];
    let mut data = vec![0.0_f32; n_values];
    reader.read_f32_into::<LittleEndian>(&mut data)?;
    Ok((shape, data))
}

fn parse_shape(header: &str) -> Result<[usize; 3]> {
    let start = header
        .find('(')
        .ok_or_else(|| QSeekError::table("NPY header without shape tuple"))?;
    let end = header[start..]
        .find(')')
        .ok_or_else(|| QSeekError::table("NPY header without shape tuple"))?
        + start;
    let dims: Vec<usize> = header[start + 1..end]
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| QSeekError::table(format!("bad NPY shape entry {part:?}")))
        })
        .collect::<Result<_>>()?;
    if dims.len() != 3 {
        return Err(QSeekError::table(format!(
            "expected a 3-D NPY volume, got shape {dims:?}"
        )));
    }
    Ok([dims[0], dims[1], dims[2]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip() {
        let shape = [3, 4, 5];
        let data: Vec<f32> = (0..60).map(|i| i as f32 * 0.5).collect();

        let mut buffer = Vec::new();
        write_npy_f32(&mut buffer, shape, &data).unwrap();

        // Payload must start 64-byte aligned.
        assert_eq!((buffer.len() - data.len() * 4) % 64, 0);

        let (read_shape, read_data) = read_npy_f32(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(read_shape, shape);
        assert_eq!(read_data, data);
    }

    #[test]
    fn test_nan_survives_roundtrip() {
        let mut buffer = Vec::new();
        write_npy_f32(&mut buffer, [1, 1, 2], &[f32::NAN, 1.0]).unwrap();
        let (_, data) = read_npy_f32(&mut Cursor::new(&buffer)).unwrap();
        assert!(data[0].is_nan());
        assert_eq!(data[1], 1.0);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut buffer = Vec::new();
        assert!(write_npy_f32(&mut buffer, [2, 2, 2], &[0.0; 7]).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut cursor = Cursor::new(b"NOTNPY__________".to_vec());
        assert!(read_npy_f32(&mut cursor).is_err());
    }
}
