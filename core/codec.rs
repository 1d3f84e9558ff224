// Copyright 2018-2025 the Deno authors. MIT license.

//! Record codecs for [`Channel`](crate::Channel) frames.
//!
//! Both peers of a channel must agree on the codec; the wire frame carries
//! no codec marker, so a mismatch silently corrupts data.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// How channel records are serialized inside a length-prefixed frame.
///
/// `Bincode` is the default; `Json` is offered for records that need to be
/// inspectable on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
  #[default]
  Bincode,
  Json,
}

impl Codec {
  pub fn by_name(name: &str) -> Result<Codec> {
    match name {
      "Bincode" | "bincode" => Ok(Codec::Bincode),
      "Json" | "json" => Ok(Codec::Json),
      other => Err(Error::EncodingUnknown(other.to_string())),
    }
  }

  pub fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>> {
    match self {
      Codec::Bincode => {
        bincode::serialize(record).map_err(|e| Error::Codec(e.to_string()))
      }
      Codec::Json => {
        serde_json::to_vec(record).map_err(|e| Error::Codec(e.to_string()))
      }
    }
  }

  pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
    match self {
      Codec::Bincode => {
        bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
      }
      Codec::Json => {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde::Deserialize;

  use super::*;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Record {
    id: u64,
    args: Vec<i64>,
  }

  #[test]
  fn round_trips_under_both_codecs() {
    let record = Record {
      id: 7,
      args: vec![1, 2, 3],
    };
    for codec in [Codec::Bincode, Codec::Json] {
      let bytes = codec.encode(&record).unwrap();
      let back: Record = codec.decode(&bytes).unwrap();
      assert_eq!(back, record);
    }
  }

  #[test]
  fn unknown_codec_name_fails() {
    assert!(matches!(
      Codec::by_name("Storable"),
      Err(Error::EncodingUnknown(_))
    ));
  }

  #[test]
  fn truncated_payload_is_a_codec_error() {
    let bytes = Codec::Bincode.encode(&Record { id: 1, args: vec![] }).unwrap();
    let err = Codec::Bincode.decode::<Record>(&bytes[..bytes.len() - 1]);
    assert!(matches!(err, Err(Error::Codec(_))));
  }
}
