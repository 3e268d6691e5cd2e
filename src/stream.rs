//! Little-endian framing helpers for the persisted model format.

use std::{
    io::{self, Read, Write},
    mem::size_of,
};

use crate::{Result, TrainerErr};

/// Refuse to allocate blobs past this size when reading untrusted streams.
const MAX_BLOB: u64 = 1 << 34;

pub fn write_i64<W: Write>(w: &mut W, value: i64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Writes `blob` prefixed by its length as a `u64`.
pub fn write_blob<W: Write>(w: &mut W, blob: &[u8]) -> Result<()> {
    w.write_all(&(blob.len() as u64).to_le_bytes())?;
    w.write_all(blob)?;
    Ok(())
}

/// Reads a blob written by `write_blob`.
pub fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut buf = [0; 8];
    r.read_exact(&mut buf)?;
    let len = u64::from_le_bytes(buf);

    if len > MAX_BLOB {
        return Err(TrainerErr::SizeMismatch {
            what: "blob length",
            got: len as usize,
            expected: MAX_BLOB as usize,
        });
    }

    // grows with the bytes actually read, not with what the prefix claims
    let mut blob = Vec::new();
    r.by_ref().take(len).read_to_end(&mut blob)?;

    if blob.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("blob ended after {} of {len} bytes", blob.len()),
        )
        .into());
    }

    Ok(blob)
}

/// Appends `values` as little-endian `f32`s.
pub fn put_f32s(out: &mut Vec<u8>, values: &[f32]) {
    if cfg!(target_endian = "little") {
        out.extend_from_slice(bytemuck::cast_slice(values));
    } else {
        values
            .iter()
            .for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
    }
}

/// Fills `values` from the front of `bytes`, returning the unread tail.
pub fn take_f32s<'b>(bytes: &'b [u8], values: &mut [f32]) -> Result<&'b [u8]> {
    let len = values.len() * size_of::<f32>();
    if bytes.len() < len {
        return Err(TrainerErr::SizeMismatch {
            what: "weight blob",
            got: bytes.len(),
            expected: len,
        });
    }

    let (head, tail) = bytes.split_at(len);
    head.chunks_exact(size_of::<f32>())
        .zip(values.iter_mut())
        .for_each(|(chunk, v)| *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));

    Ok(tail)
}
