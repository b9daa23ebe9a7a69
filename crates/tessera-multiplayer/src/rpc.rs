//! RPC argument values and their wire tags.

use glam::Vec2;
use serde::{Deserialize, Serialize};
use tessera_net::{CodecError, DataReader, DataWriter};

use crate::network_id::NetworkId;

/// Type of one RPC argument. Part of an RPC's lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RpcType {
    U8 = 1,
    I16 = 2,
    I32 = 3,
    String = 4,
    F32 = 5,
    Vec2 = 6,
    NetworkId = 7,
    Bool = 8,
}

impl RpcType {
    fn from_u8(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            1 => Self::U8,
            2 => Self::I16,
            3 => Self::I32,
            4 => Self::String,
            5 => Self::F32,
            6 => Self::Vec2,
            7 => Self::NetworkId,
            8 => Self::Bool,
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "rpc argument",
                    tag,
                });
            }
        })
    }
}

/// One RPC argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    U8(u8),
    I16(i16),
    I32(i32),
    String(String),
    F32(f32),
    Vec2(Vec2),
    NetworkId(NetworkId),
    Bool(bool),
}

impl RpcValue {
    pub fn rpc_type(&self) -> RpcType {
        match self {
            Self::U8(_) => RpcType::U8,
            Self::I16(_) => RpcType::I16,
            Self::I32(_) => RpcType::I32,
            Self::String(_) => RpcType::String,
            Self::F32(_) => RpcType::F32,
            Self::Vec2(_) => RpcType::Vec2,
            Self::NetworkId(_) => RpcType::NetworkId,
            Self::Bool(_) => RpcType::Bool,
        }
    }

    /// Tag byte followed by the value.
    pub fn write_to(&self, writer: &mut DataWriter) -> Result<(), CodecError> {
        writer.write_u8(self.rpc_type() as u8);
        match self {
            Self::U8(v) => writer.write_u8(*v),
            Self::I16(v) => writer.write_i16(*v),
            Self::I32(v) => writer.write_i32(*v),
            Self::String(v) => writer.write_string(v)?,
            Self::F32(v) => writer.write_f32(*v),
            Self::Vec2(v) => {
                writer.write_f32(v.x);
                writer.write_f32(v.y);
            }
            Self::NetworkId(v) => v.write_to(writer),
            Self::Bool(v) => writer.write_bool(*v),
        }
        Ok(())
    }

    pub fn read_from(reader: &mut DataReader<'_>) -> Result<Self, CodecError> {
        Ok(match RpcType::from_u8(reader.read_u8()?)? {
            RpcType::U8 => Self::U8(reader.read_u8()?),
            RpcType::I16 => Self::I16(reader.read_i16()?),
            RpcType::I32 => Self::I32(reader.read_i32()?),
            RpcType::String => Self::String(reader.read_string()?),
            RpcType::F32 => Self::F32(reader.read_f32()?),
            RpcType::Vec2 => {
                let x = reader.read_f32()?;
                let y = reader.read_f32()?;
                Self::Vec2(Vec2::new(x, y))
            }
            RpcType::NetworkId => Self::NetworkId(NetworkId::read_from(reader)?),
            RpcType::Bool => Self::Bool(reader.read_bool()?),
        })
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Self::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Self::I16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vec2(&self) -> Option<Vec2> {
        match self {
            Self::Vec2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_network_id(&self) -> Option<NetworkId> {
        match self {
            Self::NetworkId(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Argument types of `args`, in order.
pub fn signature_of(args: &[RpcValue]) -> Vec<RpcType> {
    args.iter().map(RpcValue::rpc_type).collect()
}

/// Whether `args` match `signature` exactly.
pub fn matches_signature(signature: &[RpcType], args: &[RpcValue]) -> bool {
    signature.len() == args.len()
        && signature
            .iter()
            .zip(args)
            .all(|(expected, arg)| *expected == arg.rpc_type())
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RpcValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_value! {
    u8 => U8,
    i16 => I16,
    i32 => I32,
    String => String,
    f32 => F32,
    Vec2 => Vec2,
    NetworkId => NetworkId,
    bool => Bool,
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_layout() {
        let mut writer = DataWriter::new();
        RpcValue::I16(-2).write_to(&mut writer).unwrap();
        RpcValue::from("ab").write_to(&mut writer).unwrap();
        assert_eq!(writer.as_slice(), &[2, 0xFE, 0xFF, 4, 2, 0, b'a', b'b']);
    }

    #[test]
    fn test_values_decode_in_order() {
        let values = vec![
            RpcValue::U8(7),
            RpcValue::I32(-40_000),
            RpcValue::F32(1.5),
            RpcValue::Vec2(Vec2::new(3.0, -4.0)),
            RpcValue::NetworkId(NetworkId::generate(NetworkId::ROOT, 5)),
            RpcValue::Bool(true),
            RpcValue::from("name"),
        ];
        let mut writer = DataWriter::new();
        for value in &values {
            value.write_to(&mut writer).unwrap();
        }

        let mut reader = DataReader::new(writer.as_slice());
        let decoded: Vec<_> = (0..values.len())
            .map(|_| RpcValue::read_from(&mut reader).unwrap())
            .collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut reader = DataReader::new(&[42, 0]);
        assert!(matches!(
            RpcValue::read_from(&mut reader),
            Err(CodecError::UnknownTag { tag: 42, .. })
        ));
    }

    #[test]
    fn test_signature_matching() {
        let args = [RpcValue::I32(1), RpcValue::from("x")];
        assert!(matches_signature(&[RpcType::I32, RpcType::String], &args));
        assert!(!matches_signature(&[RpcType::I32], &args));
        assert!(!matches_signature(&[RpcType::I16, RpcType::String], &args));
        assert_eq!(signature_of(&args), vec![RpcType::I32, RpcType::String]);
    }
}
