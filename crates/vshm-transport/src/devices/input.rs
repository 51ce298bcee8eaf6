//! Input device config blob.
//!
//! The driver writes `select`/`subsel`; the device answers by filling `size` and `payload`.
//! [`InputConfigPayload::decode`] is the driver-side view of an answer and
//! [`InputIdentity::answer`] builds answers on the device side.

use std::collections::BTreeMap;

use thiserror::Error;
use vshm_abi::input::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputConfigError {
    #[error("payload size {size} exceeds the 128-byte overlay")]
    PayloadTooLarge { size: usize },

    #[error("unknown config select 0x{0:02x}")]
    UnknownSelect(u8),

    #[error("select 0x{select:02x} does not take subsel {subsel}")]
    UnexpectedSubsel { select: u8, subsel: u8 },

    #[error("select 0x{select:02x} needs {expected} payload bytes, got {size}")]
    BadSize {
        select: u8,
        size: u8,
        expected: usize,
    },

    #[error("identifier string is not UTF-8")]
    NotUtf8,
}

/// One decoded config answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputConfigPayload {
    Unset,
    Name(String),
    Serial(String),
    DevIds(InputDevIds),
    PropBits(Vec<u8>),
    EvBits { ev_type: u8, bitmap: Vec<u8> },
    AbsInfo { axis: u8, info: InputAbsInfo },
    /// The device has nothing for this selector.
    Unavailable { select: u8, subsel: u8 },
}

fn id_string(payload: &[u8]) -> Result<String, InputConfigError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8(payload[..end].to_vec()).map_err(|_| InputConfigError::NotUtf8)
}

impl InputConfigPayload {
    /// Decode after checking `select`, `subsel` and `size` against each other.
    pub fn decode(config: &InputConfig) -> Result<Self, InputConfigError> {
        let size = usize::from(config.size);
        if size > VIRTIO_INPUT_PAYLOAD_BYTES {
            return Err(InputConfigError::PayloadTooLarge { size });
        }
        let (select, subsel) = (config.select, config.subsel);
        let no_subsel = || {
            if subsel == 0 {
                Ok(())
            } else {
                Err(InputConfigError::UnexpectedSubsel { select, subsel })
            }
        };
        let exact = |expected: usize| {
            if size == expected {
                Ok(())
            } else {
                Err(InputConfigError::BadSize {
                    select,
                    size: config.size,
                    expected,
                })
            }
        };

        match select {
            VIRTIO_INPUT_CFG_UNSET => return Ok(Self::Unset),
            VIRTIO_INPUT_CFG_ID_NAME
            | VIRTIO_INPUT_CFG_ID_SERIAL
            | VIRTIO_INPUT_CFG_ID_DEVIDS
            | VIRTIO_INPUT_CFG_PROP_BITS => no_subsel()?,
            VIRTIO_INPUT_CFG_EV_BITS | VIRTIO_INPUT_CFG_ABS_INFO => {}
            other => return Err(InputConfigError::UnknownSelect(other)),
        }
        if size == 0 {
            return Ok(Self::Unavailable { select, subsel });
        }

        let payload = &config.payload[..size];
        Ok(match select {
            VIRTIO_INPUT_CFG_ID_NAME => Self::Name(id_string(payload)?),
            VIRTIO_INPUT_CFG_ID_SERIAL => Self::Serial(id_string(payload)?),
            VIRTIO_INPUT_CFG_ID_DEVIDS => {
                exact(InputDevIds::SIZE)?;
                Self::DevIds(bytemuck::pod_read_unaligned(payload))
            }
            VIRTIO_INPUT_CFG_PROP_BITS => Self::PropBits(payload.to_vec()),
            VIRTIO_INPUT_CFG_EV_BITS => Self::EvBits {
                ev_type: subsel,
                bitmap: payload.to_vec(),
            },
            _ => {
                exact(InputAbsInfo::SIZE)?;
                Self::AbsInfo {
                    axis: subsel,
                    info: bytemuck::pod_read_unaligned(payload),
                }
            }
        })
    }

    /// Encode as a full config blob.
    pub fn encode(&self) -> Result<InputConfig, InputConfigError> {
        let mut config = InputConfig::default();
        let (select, subsel, bytes): (u8, u8, &[u8]) = match self {
            Self::Unset => (VIRTIO_INPUT_CFG_UNSET, 0, &[]),
            Self::Name(name) => (VIRTIO_INPUT_CFG_ID_NAME, 0, name.as_bytes()),
            Self::Serial(serial) => (VIRTIO_INPUT_CFG_ID_SERIAL, 0, serial.as_bytes()),
            Self::DevIds(ids) => (VIRTIO_INPUT_CFG_ID_DEVIDS, 0, bytemuck::bytes_of(ids)),
            Self::PropBits(bits) => (VIRTIO_INPUT_CFG_PROP_BITS, 0, bits.as_slice()),
            Self::EvBits { ev_type, bitmap } => {
                (VIRTIO_INPUT_CFG_EV_BITS, *ev_type, bitmap.as_slice())
            }
            Self::AbsInfo { axis, info } => {
                (VIRTIO_INPUT_CFG_ABS_INFO, *axis, bytemuck::bytes_of(info))
            }
            Self::Unavailable { select, subsel } => (*select, *subsel, &[]),
        };
        if bytes.len() > VIRTIO_INPUT_PAYLOAD_BYTES {
            return Err(InputConfigError::PayloadTooLarge { size: bytes.len() });
        }
        config.select = select;
        config.subsel = subsel;
        config.size = bytes.len() as u8;
        config.payload[..bytes.len()].copy_from_slice(bytes);
        Ok(config)
    }
}

/// What an input device reports through its config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputIdentity {
    pub name: String,
    pub serial: String,
    pub ids: InputDevIds,
    pub prop_bits: Vec<u8>,
    /// Supported codes per event type. Key `0` lists the event types themselves.
    pub ev_bits: BTreeMap<u8, Vec<u8>>,
    pub abs: BTreeMap<u8, InputAbsInfo>,
}

fn set_bit(bitmap: &mut Vec<u8>, bit: u16) {
    let byte = usize::from(bit / 8);
    if byte >= VIRTIO_INPUT_PAYLOAD_BYTES {
        return;
    }
    if bitmap.len() <= byte {
        bitmap.resize(byte + 1, 0);
    }
    bitmap[byte] |= 1 << (bit % 8);
}

impl InputIdentity {
    /// Mark `code` as supported for `ev_type`, and `ev_type` itself as supported.
    pub fn support(&mut self, ev_type: u8, code: u16) {
        set_bit(self.ev_bits.entry(0).or_default(), u16::from(ev_type));
        set_bit(self.ev_bits.entry(ev_type).or_default(), code);
    }

    /// The blob the device exposes after the driver selected `(select, subsel)`.
    ///
    /// Unknown selectors and empty answers are reported with `size = 0`. Strings are
    /// NUL-terminated and truncated to the payload.
    pub fn answer(&self, select: u8, subsel: u8) -> InputConfig {
        let mut config = InputConfig {
            select,
            subsel,
            ..InputConfig::default()
        };
        let mut put = |bytes: &[u8]| {
            let n = bytes.len().min(VIRTIO_INPUT_PAYLOAD_BYTES);
            config.payload[..n].copy_from_slice(&bytes[..n]);
            config.size = n as u8;
        };
        match (select, subsel) {
            (VIRTIO_INPUT_CFG_ID_NAME, 0) if !self.name.is_empty() => {
                put(&[self.name.as_bytes(), &[0u8][..]].concat())
            }
            (VIRTIO_INPUT_CFG_ID_SERIAL, 0) if !self.serial.is_empty() => {
                put(&[self.serial.as_bytes(), &[0u8][..]].concat())
            }
            (VIRTIO_INPUT_CFG_ID_DEVIDS, 0) => put(bytemuck::bytes_of(&self.ids)),
            (VIRTIO_INPUT_CFG_PROP_BITS, 0) => put(&self.prop_bits),
            (VIRTIO_INPUT_CFG_EV_BITS, ev_type) => {
                if let Some(bitmap) = self.ev_bits.get(&ev_type) {
                    put(bitmap);
                }
            }
            (VIRTIO_INPUT_CFG_ABS_INFO, axis) => {
                if let Some(info) = self.abs.get(&axis) {
                    put(bytemuck::bytes_of(info));
                }
            }
            _ => {}
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EV_KEY: u8 = 0x01;
    const EV_ABS: u8 = 0x03;
    const KEY_A: u16 = 30;

    fn tablet() -> InputIdentity {
        let mut id = InputIdentity {
            name: "vshm tablet".into(),
            ids: InputDevIds {
                bustype: 6,
                vendor: 0x1af4,
                product: 2,
                version: 1,
            },
            ..InputIdentity::default()
        };
        id.support(EV_KEY, KEY_A);
        id.support(EV_ABS, 0);
        id.abs.insert(
            0,
            InputAbsInfo {
                min: 0,
                max: 32767,
                ..InputAbsInfo::default()
            },
        );
        id
    }

    #[test]
    fn answers_decode_to_the_identity() {
        let id = tablet();
        assert_eq!(
            InputConfigPayload::decode(&id.answer(VIRTIO_INPUT_CFG_ID_NAME, 0)).unwrap(),
            InputConfigPayload::Name("vshm tablet".into())
        );
        assert_eq!(
            InputConfigPayload::decode(&id.answer(VIRTIO_INPUT_CFG_ID_DEVIDS, 0)).unwrap(),
            InputConfigPayload::DevIds(id.ids)
        );
        match InputConfigPayload::decode(&id.answer(VIRTIO_INPUT_CFG_EV_BITS, EV_KEY)).unwrap() {
            InputConfigPayload::EvBits { ev_type, bitmap } => {
                assert_eq!(ev_type, EV_KEY);
                assert_ne!(bitmap[usize::from(KEY_A / 8)] & (1 << (KEY_A % 8)), 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            InputConfigPayload::decode(&id.answer(VIRTIO_INPUT_CFG_ABS_INFO, 0)).unwrap(),
            InputConfigPayload::AbsInfo {
                axis: 0,
                info: id.abs[&0]
            }
        );
    }

    #[test]
    fn missing_data_is_unavailable() {
        let id = tablet();
        assert_eq!(
            InputConfigPayload::decode(&id.answer(VIRTIO_INPUT_CFG_ID_SERIAL, 0)).unwrap(),
            InputConfigPayload::Unavailable {
                select: VIRTIO_INPUT_CFG_ID_SERIAL,
                subsel: 0
            }
        );
        assert_eq!(
            InputConfigPayload::decode(&id.answer(VIRTIO_INPUT_CFG_ABS_INFO, 9)).unwrap(),
            InputConfigPayload::Unavailable {
                select: VIRTIO_INPUT_CFG_ABS_INFO,
                subsel: 9
            }
        );
        assert_eq!(
            InputConfigPayload::decode(&InputConfig::default()).unwrap(),
            InputConfigPayload::Unset
        );
    }

    #[test]
    fn header_fields_are_validated_before_the_payload() {
        let mut cfg = InputConfig {
            select: VIRTIO_INPUT_CFG_ID_DEVIDS,
            size: 4,
            ..InputConfig::default()
        };
        assert_eq!(
            InputConfigPayload::decode(&cfg),
            Err(InputConfigError::BadSize {
                select: VIRTIO_INPUT_CFG_ID_DEVIDS,
                size: 4,
                expected: 8
            })
        );
        cfg.size = 200;
        assert_eq!(
            InputConfigPayload::decode(&cfg),
            Err(InputConfigError::PayloadTooLarge { size: 200 })
        );
        cfg.size = 8;
        cfg.subsel = 1;
        assert!(matches!(
            InputConfigPayload::decode(&cfg),
            Err(InputConfigError::UnexpectedSubsel { .. })
        ));
        cfg.select = 0x7f;
        assert_eq!(
            InputConfigPayload::decode(&cfg),
            Err(InputConfigError::UnknownSelect(0x7f))
        );
    }

    #[test]
    fn encode_refuses_oversized_payloads() {
        let long = InputConfigPayload::PropBits(vec![0; 129]);
        assert_eq!(
            long.encode(),
            Err(InputConfigError::PayloadTooLarge { size: 129 })
        );
        let cfg = InputConfigPayload::Serial("SN-1".into()).encode().unwrap();
        assert_eq!((cfg.select, cfg.size), (VIRTIO_INPUT_CFG_ID_SERIAL, 4));
        assert_eq!(
            InputConfigPayload::decode(&cfg).unwrap(),
            InputConfigPayload::Serial("SN-1".into())
        );
    }
}
