//! Structured inter-broker message.
//!
//! A [`ClusterPacket`] carries a numeric type tag, a bag of named typed
//! properties, an opaque payload and a bit-flag field. The whole packet is
//! serialized with `MsgPack` (`rmp_serde::to_vec_named()`); framing on the
//! wire is the transport's concern.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bit set when the sender expects a reply packet.
pub const ACK_REQUESTED: u32 = 0x0001;

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropValue {
    Int(i32),
    Long(i64),
    Str(String),
    Bool(bool),
}

/// Errors produced while encoding or decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("packet decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("property {name} is missing or has the wrong type")]
    MissingProperty { name: &'static str },
}

/// Inter-broker message with a type tag, properties, payload and flag bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPacket {
    packet_type: u16,
    props: BTreeMap<String, PropValue>,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    bits: u32,
}

impl ClusterPacket {
    /// Creates an empty packet of the given type.
    #[must_use]
    pub fn new(packet_type: u16) -> Self {
        Self {
            packet_type,
            props: BTreeMap::new(),
            payload: Vec::new(),
            bits: 0,
        }
    }

    #[must_use]
    pub fn packet_type(&self) -> u16 {
        self.packet_type
    }

    // -- Properties ---------------------------------------------------------

    pub fn set_prop(&mut self, name: &str, value: PropValue) {
        self.props.insert(name.to_string(), value);
    }

    pub fn set_int(&mut self, name: &str, value: i32) {
        self.set_prop(name, PropValue::Int(value));
    }

    pub fn set_long(&mut self, name: &str, value: i64) {
        self.set_prop(name, PropValue::Long(value));
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) {
        self.set_prop(name, PropValue::Str(value.into()));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.set_prop(name, PropValue::Bool(value));
    }

    #[must_use]
    pub fn prop(&self, name: &str) -> Option<&PropValue> {
        self.props.get(name)
    }

    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.props.get(name) {
            Some(PropValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Reads a long property. Int properties widen.
    #[must_use]
    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.props.get(name) {
            Some(PropValue::Long(v)) => Some(*v),
            Some(PropValue::Int(v)) => Some(i64::from(*v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.props.get(name) {
            Some(PropValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.props.get(name) {
            Some(PropValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Reads an unsigned 64-bit value stored as a long property.
    ///
    /// Correlation ids and session UIDs travel as `Long` and are reinterpreted
    /// bit-for-bit.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::MissingProperty`] if the property is absent.
    #[allow(clippy::cast_sign_loss)]
    pub fn require_u64(&self, name: &'static str) -> Result<u64, PacketError> {
        self.get_long(name)
            .map(|v| v as u64)
            .ok_or(PacketError::MissingProperty { name })
    }

    /// Stores an unsigned 64-bit value as a long property.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_u64(&mut self, name: &str, value: u64) {
        self.set_long(name, value as i64);
    }

    /// # Errors
    ///
    /// Returns [`PacketError::MissingProperty`] if the property is absent.
    pub fn require_str(&self, name: &'static str) -> Result<&str, PacketError> {
        self.get_str(name).ok_or(PacketError::MissingProperty { name })
    }

    // -- Payload ------------------------------------------------------------

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Serializes `value` into the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be encoded.
    pub fn set_payload_value<T: Serialize>(&mut self, value: &T) -> Result<(), PacketError> {
        self.payload = rmp_serde::to_vec_named(value)?;
        Ok(())
    }

    /// Deserializes the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode as `T`.
    pub fn payload_value<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    // -- Flag bits ----------------------------------------------------------

    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn set_bit(&mut self, bit: u32, on: bool) {
        if on {
            self.bits |= bit;
        } else {
            self.bits &= !bit;
        }
    }

    #[must_use]
    pub fn is_bit_set(&self, bit: u32) -> bool {
        self.bits & bit == bit
    }

    #[must_use]
    pub fn ack_requested(&self) -> bool {
        self.is_bit_set(ACK_REQUESTED)
    }

    // -- Serialization ------------------------------------------------------

    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoded packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
