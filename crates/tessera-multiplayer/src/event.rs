//! Application events carried inside transport events.
//!
//! Every event starts with a one-byte discriminator. Decoding borrows the
//! opaque bodies from the transport buffer.

use tessera_net::{CodecError, DataReader, DataWriter};

use crate::network_id::NetworkId;
use crate::rpc::RpcValue;

/// Wire discriminator of an application event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    Rpc = 0,
    Synchronize = 1,
    EntityMessage = 2,
    EntityMessageResponse = 3,
}

/// Whether an entity message expects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Plain,
    Request(u16),
}

impl MessageKind {
    pub fn request_id(&self) -> Option<u16> {
        match self {
            Self::Plain => None,
            Self::Request(id) => Some(*id),
        }
    }
}

/// One decoded application event.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent<'a> {
    Rpc {
        view: NetworkId,
        method: String,
        args: Vec<RpcValue>,
    },
    Synchronize {
        view: NetworkId,
        data: &'a [u8],
    },
    EntityMessage {
        view: NetworkId,
        type_id: u16,
        kind: MessageKind,
        body: &'a [u8],
    },
    Response {
        type_id: u16,
        request_id: u16,
        body: &'a [u8],
    },
}

impl<'a> NetworkEvent<'a> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Rpc { .. } => EventKind::Rpc,
            Self::Synchronize { .. } => EventKind::Synchronize,
            Self::EntityMessage { .. } => EventKind::EntityMessage,
            Self::Response { .. } => EventKind::EntityMessageResponse,
        }
    }

    pub fn write_to(&self, writer: &mut DataWriter) -> Result<(), CodecError> {
        writer.write_u8(self.kind() as u8);
        match self {
            Self::Rpc { view, method, args } => {
                view.write_to(writer);
                writer.write_string(method)?;
                let count = u8::try_from(args.len()).map_err(|_| CodecError::TooLong(args.len()))?;
                writer.write_u8(count);
                for arg in args {
                    arg.write_to(writer)?;
                }
            }
            Self::Synchronize { view, data } => {
                view.write_to(writer);
                writer.write_bytes(data)?;
            }
            Self::EntityMessage {
                view,
                type_id,
                kind,
                body,
            } => {
                view.write_to(writer);
                writer.write_u16(*type_id);
                match kind {
                    MessageKind::Plain => writer.write_u8(0),
                    MessageKind::Request(request_id) => {
                        writer.write_u8(1);
                        writer.write_u16(*request_id);
                    }
                }
                writer.write_bytes(body)?;
            }
            Self::Response {
                type_id,
                request_id,
                body,
            } => {
                writer.write_u16(*type_id);
                writer.write_u16(*request_id);
                writer.write_bytes(body)?;
            }
        }
        Ok(())
    }

    pub fn read_from(reader: &mut DataReader<'a>) -> Result<Self, CodecError> {
        let event = match reader.read_u8()? {
            0 => {
                let view = NetworkId::read_from(reader)?;
                let method = reader.read_string()?;
                let count = reader.read_u8()?;
                let args = (0..count)
                    .map(|_| RpcValue::read_from(reader))
                    .collect::<Result<_, _>>()?;
                Self::Rpc { view, method, args }
            }
            1 => Self::Synchronize {
                view: NetworkId::read_from(reader)?,
                data: reader.read_bytes()?,
            },
            2 => {
                let view = NetworkId::read_from(reader)?;
                let type_id = reader.read_u16()?;
                let kind = match reader.read_u8()? {
                    0 => MessageKind::Plain,
                    1 => MessageKind::Request(reader.read_u16()?),
                    tag => {
                        return Err(CodecError::UnknownTag {
                            what: "entity message kind",
                            tag,
                        });
                    }
                };
                Self::EntityMessage {
                    view,
                    type_id,
                    kind,
                    body: reader.read_bytes()?,
                }
            }
            3 => Self::Response {
                type_id: reader.read_u16()?,
                request_id: reader.read_u16()?,
                body: reader.read_bytes()?,
            },
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "network event",
                    tag,
                });
            }
        };
        Ok(event)
    }

    /// Decode one complete transport event.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, CodecError> {
        Self::read_from(&mut DataReader::new(bytes))
    }
}
