use crate::{bits, cobs, DeviceUid, MessageError, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};

/// Smart Device frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0x10,
    SubReq = 0x11,
    SubRes = 0x12,
    DevRead = 0x13,
    DevWrite = 0x14,
    DevData = 0x15,
    DevDisable = 0x16,
    HbReq = 0x17,
    HbRes = 0x18,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_u8(type_id: u8) -> Result<Self, MessageError> {
        Ok(match type_id {
            0x10 => Self::Ping,
            0x11 => Self::SubReq,
            0x12 => Self::SubRes,
            0x13 => Self::DevRead,
            0x14 => Self::DevWrite,
            0x15 => Self::DevData,
            0x16 => Self::DevDisable,
            0x17 => Self::HbReq,
            0x18 => Self::HbRes,
            0xFF => Self::Error,
            other => return Err(MessageError::UnknownType { type_id: other }),
        })
    }
}

/// Error codes a device or the runtime can put in an `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidType = 0xFB,
    MalformedPayload = 0xFC,
    UnexpectedDelimiter = 0xFD,
    ChecksumError = 0xFE,
    GenericError = 0xFF,
}

impl ErrorCode {
    /// Unknown codes collapse to [`ErrorCode::GenericError`].
    pub fn from_u8(code: u8) -> Self {
        match code {
            0xFB => Self::InvalidType,
            0xFC => Self::MalformedPayload,
            0xFD => Self::UnexpectedDelimiter,
            0xFE => Self::ChecksumError,
            _ => Self::GenericError,
        }
    }

    /// The error frame appropriate for a decode failure.
    pub fn for_decode_error(err: &MessageError) -> Self {
        match err {
            MessageError::InvalidEncoding => Self::UnexpectedDelimiter,
            MessageError::BadChecksum { .. } => Self::ChecksumError,
            MessageError::UnknownType { .. } => Self::InvalidType,
            MessageError::LengthMismatch { .. } => Self::MalformedPayload,
            _ => Self::GenericError,
        }
    }
}

/// Resolves a parameter index to the fixed-width byte slot holding its value.
///
/// The buffer layer implements this over shared-memory blocks (under the
/// buffer mutex); tests implement it over plain arrays. Indices without a
/// slot are skipped by the codec: they contribute no bytes and are dropped
/// from the effective bitmap.
pub trait ParameterMap {
    fn slot(&self, index: usize) -> Option<&[u8]>;
    fn slot_mut(&mut self, index: usize) -> Option<&mut [u8]>;
}

/// One Smart Device frame, pre-encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    ty: MessageType,
    len: u8,
    payload: [u8; MAX_PAYLOAD_SIZE],
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("ty", &self.ty)
            .field("payload", &&self.payload[..self.len as usize])
            .finish()
    }
}

impl Message {
    fn with_payload(ty: MessageType, payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MessageError::PayloadOverflow);
        }
        let mut message = Self {
            ty,
            len: payload.len() as u8,
            payload: [0; MAX_PAYLOAD_SIZE],
        };
        message.payload[..payload.len()].copy_from_slice(payload);
        Ok(message)
    }

    pub fn ping() -> Self {
        Self::with_payload(MessageType::Ping, &[]).unwrap()
    }

    pub fn sub_req(params: u16, interval_ms: u16) -> Self {
        let mut payload = [0u8; 4];
        payload[0..2].copy_from_slice(&params.to_le_bytes());
        payload[2..4].copy_from_slice(&interval_ms.to_le_bytes());
        Self::with_payload(MessageType::SubReq, &payload).unwrap()
    }

    /// An unsubscribe is a subscription to nothing.
    pub fn unsubscribe() -> Self {
        Self::sub_req(0, 0)
    }

    pub fn sub_res(params: u16, interval_ms: u16, uid: DeviceUid) -> Self {
        let mut payload = [0u8; 4 + DeviceUid::WIRE_SIZE];
        payload[0..2].copy_from_slice(&params.to_le_bytes());
        payload[2..4].copy_from_slice(&interval_ms.to_le_bytes());
        uid.write_to(&mut payload[4..]);
        Self::with_payload(MessageType::SubRes, &payload).unwrap()
    }

    pub fn dev_read(params: u16) -> Self {
        Self::with_payload(MessageType::DevRead, &params.to_le_bytes()).unwrap()
    }

    pub fn dev_write(params: u16, map: &impl ParameterMap) -> Result<Self, MessageError> {
        Self::gather(MessageType::DevWrite, params, map)
    }

    pub fn dev_data(params: u16, map: &impl ParameterMap) -> Result<Self, MessageError> {
        Self::gather(MessageType::DevData, params, map)
    }

    pub fn dev_disable() -> Self {
        Self::with_payload(MessageType::DevDisable, &[]).unwrap()
    }

    pub fn hb_req(id: u8) -> Self {
        Self::with_payload(MessageType::HbReq, &[id]).unwrap()
    }

    pub fn hb_res(id: u8) -> Self {
        Self::with_payload(MessageType::HbRes, &[id]).unwrap()
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::with_payload(MessageType::Error, &[code as u8]).unwrap()
    }

    /// Build a value-carrying frame: the effective bitmap followed by each
    /// mapped parameter's bytes in index order.
    fn gather(
        ty: MessageType,
        params: u16,
        map: &impl ParameterMap,
    ) -> Result<Self, MessageError> {
        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        let mut cursor = 2;
        let mut emitted = 0u16;
        for index in bits(params) {
            let Some(slot) = map.slot(index) else {
                continue;
            };
            if cursor + slot.len() > MAX_PAYLOAD_SIZE {
                return Err(MessageError::PayloadOverflow);
            }
            payload[cursor..cursor + slot.len()].copy_from_slice(slot);
            cursor += slot.len();
            emitted |= 1 << index;
        }
        payload[0..2].copy_from_slice(&emitted.to_le_bytes());
        Self::with_payload(ty, &payload[..cursor])
    }

    pub fn ty(&self) -> MessageType {
        self.ty
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    fn expect(&self, ty: MessageType) -> Result<(), MessageError> {
        if self.ty != ty {
            return Err(MessageError::UnknownType {
                type_id: self.ty as u8,
            });
        }
        Ok(())
    }

    fn payload_exact(&self, ty: MessageType, len: usize) -> Result<&[u8], MessageError> {
        self.expect(ty)?;
        let payload = self.payload();
        if payload.len() != len {
            return Err(MessageError::LengthMismatch {
                declared: len,
                actual: payload.len(),
            });
        }
        Ok(payload)
    }

    pub fn read_sub_req(&self) -> Result<(u16, u16), MessageError> {
        let p = self.payload_exact(MessageType::SubReq, 4)?;
        Ok((
            u16::from_le_bytes([p[0], p[1]]),
            u16::from_le_bytes([p[2], p[3]]),
        ))
    }

    pub fn read_sub_res(&self) -> Result<(u16, u16, DeviceUid), MessageError> {
        let p = self.payload_exact(MessageType::SubRes, 4 + DeviceUid::WIRE_SIZE)?;
        Ok((
            u16::from_le_bytes([p[0], p[1]]),
            u16::from_le_bytes([p[2], p[3]]),
            DeviceUid::read_from(&p[4..]),
        ))
    }

    pub fn read_dev_read(&self) -> Result<u16, MessageError> {
        let p = self.payload_exact(MessageType::DevRead, 2)?;
        Ok(u16::from_le_bytes([p[0], p[1]]))
    }

    pub fn read_hb_req(&self) -> Result<u8, MessageError> {
        Ok(self.payload_exact(MessageType::HbReq, 1)?[0])
    }

    pub fn read_hb_res(&self) -> Result<u8, MessageError> {
        Ok(self.payload_exact(MessageType::HbRes, 1)?[0])
    }

    pub fn read_error(&self) -> Result<ErrorCode, MessageError> {
        Ok(ErrorCode::from_u8(self.payload_exact(MessageType::Error, 1)?[0]))
    }

    /// Scatter a `DEV_WRITE`/`DEV_DATA` payload into the parameter map.
    ///
    /// Bits without a slot consume no payload bytes and are dropped from the
    /// returned bitmap, so a frame touching only unmapped parameters applies
    /// as a no-op.
    pub fn read_values(&self, map: &mut impl ParameterMap) -> Result<u16, MessageError> {
        if self.ty != MessageType::DevWrite && self.ty != MessageType::DevData {
            return Err(MessageError::UnknownType {
                type_id: self.ty as u8,
            });
        }
        let payload = self.payload();
        if payload.len() < 2 {
            return Err(MessageError::LengthMismatch {
                declared: 2,
                actual: payload.len(),
            });
        }
        let bitmap = u16::from_le_bytes([payload[0], payload[1]]);
        let mut cursor = 2;
        let mut applied = 0u16;
        for index in bits(bitmap) {
            let Some(slot) = map.slot_mut(index) else {
                continue;
            };
            if cursor + slot.len() > payload.len() {
                return Err(MessageError::LengthMismatch {
                    declared: cursor + slot.len(),
                    actual: payload.len(),
                });
            }
            let width = slot.len();
            slot.copy_from_slice(&payload[cursor..cursor + width]);
            cursor += width;
            applied |= 1 << index;
        }
        if cursor != payload.len() {
            return Err(MessageError::LengthMismatch {
                declared: cursor,
                actual: payload.len(),
            });
        }
        Ok(applied)
    }

    /// Byte-stuff this frame into a caller-owned buffer, returning the bytes
    /// written. The trailing wire delimiter is not included.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, MessageError> {
        let mut raw = [0u8; MAX_FRAME_SIZE];
        let len = self.len as usize;
        raw[0] = self.ty as u8;
        raw[1] = self.len;
        raw[2..2 + len].copy_from_slice(self.payload());
        raw[2 + len] = raw[..2 + len].iter().fold(0, |acc, &b| acc ^ b);
        cobs::stuff(&raw[..3 + len], buf)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; cobs::max_stuffed_len(MAX_FRAME_SIZE)];
        let n = self.encode_into(&mut buf).expect("buffer is max-sized");
        buf.truncate(n);
        buf
    }

    /// Decode one byte-stuffed frame (without its delimiter).
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut raw = [0u8; MAX_FRAME_SIZE];
        let n = match cobs::unstuff(bytes, &mut raw) {
            Ok(n) => n,
            Err(MessageError::BufferTooSmall) => return Err(MessageError::InvalidEncoding),
            Err(err) => return Err(err),
        };
        if n < 3 {
            return Err(MessageError::InvalidEncoding);
        }
        let computed = raw[..n - 1].iter().fold(0, |acc, &b| acc ^ b);
        if computed != raw[n - 1] {
            return Err(MessageError::BadChecksum {
                expected: raw[n - 1],
                computed,
            });
        }
        let ty = MessageType::from_u8(raw[0])?;
        let declared = raw[1] as usize;
        if declared != n - 3 {
            return Err(MessageError::LengthMismatch {
                declared,
                actual: n - 3,
            });
        }
        Self::with_payload(ty, &raw[2..2 + declared])
    }
}
