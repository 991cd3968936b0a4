//! Wire encoding of snapshots.
//!
//! ```text
//! data = base64( zlib( json(Snapshot) ) )
//! ```
//!
//! The remote collector decodes this exact layering, so the format is fixed.
//! JSON floats are written with round-trip precision; decoding an encoded
//! snapshot yields a bit-identical value.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use super::error::Result;
use super::model::Snapshot;

pub fn encode_snapshot(snapshot: &Snapshot) -> Result<String> {
    let json = serde_json::to_vec(snapshot)?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode_snapshot(data: &str) -> Result<Snapshot> {
    let compressed = STANDARD.decode(data.trim())?;
    let mut json = Vec::new();
    ZlibDecoder::new(&compressed[..]).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
