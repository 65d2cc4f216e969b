//! Application-facing message shapes layered on top of [`crate::frame`].
//!
//! A [`Frame`] only knows about bytes, routes and raw extension TLVs; this
//! module gives the two extension kinds the rest of the node cares about —
//! awaitable bindings and status codes — typed accessors, and distinguishes
//! the two parcel kinds a peer can exchange.

use crate::error::Error;
use crate::frame::{Extension, Frame, Header};

const EXTENSION_AWAITABLE: u8 = 1;
const EXTENSION_STATUS: u8 = 2;
const EXTENSION_PLATFORM_TYPE: u8 = 3;

/// Which platform-level control message a [`PlatformParcel`] carries.
/// Carried as an extension rather than a dedicated header field, like
/// [`Status`] — the header stays generic across both parcel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformType {
    Handshake,
    HeartbeatRequest,
    HeartbeatResponse,
}

impl PlatformType {
    fn to_byte(self) -> u8 {
        match self {
            PlatformType::Handshake => 0,
            PlatformType::HeartbeatRequest => 1,
            PlatformType::HeartbeatResponse => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(PlatformType::Handshake),
            1 => Ok(PlatformType::HeartbeatRequest),
            2 => Ok(PlatformType::HeartbeatResponse),
            _ => Err(Error::MalformedExtension),
        }
    }

    fn encode(self) -> Extension {
        Extension {
            kind: EXTENSION_PLATFORM_TYPE,
            payload: vec![self.to_byte()],
        }
    }

    fn decode(extension: &Extension) -> Result<Self, Error> {
        match extension.payload.as_slice() {
            [byte] => Self::from_byte(*byte),
            _ => Err(Error::MalformedExtension),
        }
    }
}

/// Whether an [`Awaitable`] extension marks the message that originates a
/// tracked request, or the reply that fulfills it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitableBinding {
    Request,
    Response,
}

impl AwaitableBinding {
    fn to_byte(self) -> u8 {
        match self {
            AwaitableBinding::Request => 0,
            AwaitableBinding::Response => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(AwaitableBinding::Request),
            1 => Ok(AwaitableBinding::Response),
            _ => Err(Error::MalformedExtension),
        }
    }
}

/// Ties a message to a tracked request via the tracking service's 16-byte
/// key (see `mesh-core`'s tracking service).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Awaitable {
    pub binding: AwaitableBinding,
    pub tracker_key: [u8; 16],
}

impl Awaitable {
    fn encode(self) -> Extension {
        let mut payload = Vec::with_capacity(17);
        payload.push(self.binding.to_byte());
        payload.extend_from_slice(&self.tracker_key);
        Extension {
            kind: EXTENSION_AWAITABLE,
            payload,
        }
    }

    fn decode(extension: &Extension) -> Result<Self, Error> {
        if extension.payload.len() != 17 {
            return Err(Error::MalformedExtension);
        }
        let binding = AwaitableBinding::from_byte(extension.payload[0])?;
        let mut tracker_key = [0u8; 16];
        tracker_key.copy_from_slice(&extension.payload[1..]);
        Ok(Self {
            binding,
            tracker_key,
        })
    }
}

/// A response status code, carried as an extension rather than a header
/// field since only response parcels use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
}

impl Status {
    fn encode(self) -> Extension {
        Extension {
            kind: EXTENSION_STATUS,
            payload: self.code.to_le_bytes().to_vec(),
        }
    }

    fn decode(extension: &Extension) -> Result<Self, Error> {
        let bytes: [u8; 2] = extension
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedExtension)?;
        Ok(Self {
            code: u16::from_le_bytes(bytes),
        })
    }
}

/// A parcel exchanged between peers at the message-routing layer, carrying
/// an optional awaitable binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationParcel {
    pub frame: Frame,
}

impl ApplicationParcel {
    pub fn new(header: Header, payload: Vec<u8>, validator: Vec<u8>) -> Self {
        Self {
            frame: Frame {
                header,
                payload,
                validator,
            },
        }
    }

    pub fn awaitable(&self) -> Result<Option<Awaitable>, Error> {
        find_extension(&self.frame, EXTENSION_AWAITABLE, Awaitable::decode)
    }

    pub fn with_awaitable(mut self, awaitable: Awaitable) -> Self {
        self.frame.header.extensions.push(awaitable.encode());
        self
    }

    /// Response status, when this application parcel is a reply to a
    /// tracked request. Absent on the originating request.
    pub fn status(&self) -> Result<Option<Status>, Error> {
        find_extension(&self.frame, EXTENSION_STATUS, Status::decode)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.frame.header.extensions.push(status.encode());
        self
    }
}

/// A parcel used for node-to-node control traffic (handshake progress,
/// heartbeats), carrying an optional status code rather than an awaitable
/// binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformParcel {
    pub frame: Frame,
}

impl PlatformParcel {
    pub fn new(header: Header, payload: Vec<u8>, validator: Vec<u8>) -> Self {
        Self {
            frame: Frame {
                header,
                payload,
                validator,
            },
        }
    }

    pub fn status(&self) -> Result<Option<Status>, Error> {
        find_extension(&self.frame, EXTENSION_STATUS, Status::decode)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.frame.header.extensions.push(status.encode());
        self
    }

    pub fn platform_type(&self) -> Result<Option<PlatformType>, Error> {
        find_extension(&self.frame, EXTENSION_PLATFORM_TYPE, PlatformType::decode)
    }

    pub fn with_platform_type(mut self, platform_type: PlatformType) -> Self {
        self.frame.header.extensions.push(platform_type.encode());
        self
    }
}

fn find_extension<T>(
    frame: &Frame,
    kind: u8,
    decode: impl Fn(&Extension) -> Result<T, Error>,
) -> Result<Option<T>, Error> {
    match frame.header.extensions.iter().find(|ext| ext.kind == kind) {
        Some(extension) => decode(extension).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Header;

    #[test]
    fn application_parcel_carries_awaitable_request() {
        let header = Header::new(1, 0, vec![1, 2, 3, 4]);
        let parcel = ApplicationParcel::new(header, b"payload".to_vec(), vec![0xAB; 4])
            .with_awaitable(Awaitable {
                binding: AwaitableBinding::Request,
                tracker_key: [7u8; 16],
            });

        let awaitable = parcel.awaitable().unwrap().unwrap();
        assert_eq!(awaitable.binding, AwaitableBinding::Request);
        assert_eq!(awaitable.tracker_key, [7u8; 16]);
    }

    #[test]
    fn platform_parcel_carries_status() {
        let header = Header::new(1, 0, vec![1]);
        let parcel = PlatformParcel::new(header, Vec::new(), Vec::new())
            .with_status(Status { code: 204 });

        assert_eq!(parcel.status().unwrap().unwrap().code, 204);
    }

    #[test]
    fn missing_extension_is_none() {
        let header = Header::new(1, 0, vec![1]);
        let parcel = ApplicationParcel::new(header, Vec::new(), Vec::new());
        assert!(parcel.awaitable().unwrap().is_none());
    }
}
