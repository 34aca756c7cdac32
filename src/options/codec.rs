//! TLV framing of options inside records.
//!
//! Wire format:
//! ```text
//! fixed-length           [type][payload]
//! variable-length, first [type][length: u32 BE][chunk]
//! continuation           [type][length | 0x8000_0000][chunk]
//! ```
//!
//! A frame never exceeds one record. A variable-length option whose payload
//! does not fit in the first record continues in records repeating the type
//! and the declared length, with the top bit of the length set, until the
//! declared length is reached.

use tracing::{debug, trace};

use super::types::OptionType;
use crate::core::constants::{
    FIXED_OPTION_MAX_PAYLOAD, OPTION_LENGTH_SIZE, OPTION_TYPE_SIZE, VARLEN_CHUNK,
    VARLEN_CONTINUATION_FLAG,
};
use crate::core::error::{ProtocolViolation, TcplsResult};

fn varlen_record(option_type: OptionType, prefix: u32, chunk: &[u8]) -> TcplsResult<Vec<u8>> {
    let mut record = Vec::new();
    record.try_reserve_exact(OPTION_TYPE_SIZE + OPTION_LENGTH_SIZE + chunk.len())?;
    record.push(option_type.as_u8());
    record.extend_from_slice(&prefix.to_be_bytes());
    record.extend_from_slice(chunk);
    Ok(record)
}

/// Frame an option into record plaintexts.
pub fn frame_option(option_type: OptionType, payload: &[u8]) -> TcplsResult<Vec<Vec<u8>>> {
    if !option_type.is_variable_length() {
        if payload.len() > FIXED_OPTION_MAX_PAYLOAD {
            return Err(ProtocolViolation::OptionTooLarge {
                declared: payload.len(),
                max: FIXED_OPTION_MAX_PAYLOAD,
            }
            .into());
        }
        let mut record = Vec::new();
        record.try_reserve_exact(OPTION_TYPE_SIZE + payload.len())?;
        record.push(option_type.as_u8());
        record.extend_from_slice(payload);
        return Ok(vec![record]);
    }

    let declared = u32::try_from(payload.len())
        .ok()
        .filter(|len| len & VARLEN_CONTINUATION_FLAG == 0)
        .ok_or(ProtocolViolation::OptionTooLarge {
            declared: payload.len(),
            max: (VARLEN_CONTINUATION_FLAG - 1) as usize,
        })?;

    let mut records = Vec::new();
    records.try_reserve(payload.len().div_ceil(VARLEN_CHUNK).max(1))?;

    let mut chunks = payload.chunks(VARLEN_CHUNK);
    records.push(varlen_record(option_type, declared, chunks.next().unwrap_or(&[]))?);
    for chunk in chunks {
        records.push(varlen_record(
            option_type,
            declared | VARLEN_CONTINUATION_FLAG,
            chunk,
        )?);
    }

    trace!(option = ?option_type, len = payload.len(), records = records.len(), "option framed");
    Ok(records)
}

/// A fully received option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteOption {
    /// Option type.
    pub option_type: OptionType,
    /// Complete payload.
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct InFlight {
    option_type: OptionType,
    declared: usize,
    buf: Vec<u8>,
}

/// Reassembles options split across records.
///
/// At most one variable-length option is in flight at a time. A first
/// record arriving while one is in flight is dropped and the in-flight
/// option kept.
#[derive(Debug)]
pub struct Reassembler {
    in_flight: Option<InFlight>,
    max_option_size: usize,
}

impl Reassembler {
    /// Create a reassembler accepting declared lengths up to `max_option_size`.
    pub fn new(max_option_size: usize) -> Self {
        Self {
            in_flight: None,
            max_option_size,
        }
    }

    /// Option currently being reassembled and its progress.
    pub fn in_flight(&self) -> Option<(OptionType, usize, usize)> {
        self.in_flight
            .as_ref()
            .map(|f| (f.option_type, f.buf.len(), f.declared))
    }

    /// Feed one record plaintext.
    ///
    /// Returns the option once complete. Partial data is never returned.
    pub fn push(&mut self, record: &[u8]) -> TcplsResult<Option<CompleteOption>> {
        let Some((&tag, body)) = record.split_first() else {
            return Err(ProtocolViolation::Truncated {
                expected: OPTION_TYPE_SIZE,
                actual: 0,
            }
            .into());
        };
        let option_type = OptionType::from_u8(tag)?;

        if !option_type.is_variable_length() {
            let mut payload = Vec::new();
            payload.try_reserve_exact(body.len())?;
            payload.extend_from_slice(body);
            return Ok(Some(CompleteOption {
                option_type,
                payload,
            }));
        }

        let Some((prefix, chunk)) = body.split_first_chunk::<OPTION_LENGTH_SIZE>() else {
            return Err(ProtocolViolation::Truncated {
                expected: OPTION_TYPE_SIZE + OPTION_LENGTH_SIZE,
                actual: record.len(),
            }
            .into());
        };
        let prefix = u32::from_be_bytes(*prefix);
        let declared = (prefix & !VARLEN_CONTINUATION_FLAG) as usize;

        if prefix & VARLEN_CONTINUATION_FLAG != 0 {
            return self.continue_in_flight(option_type, declared, chunk);
        }

        if let Some(in_flight) = self.in_flight.as_ref() {
            return Err(ProtocolViolation::ConcurrentVariableLength {
                in_flight: in_flight.option_type,
                received: option_type,
            }
            .into());
        }

        if declared > self.max_option_size {
            return Err(ProtocolViolation::OptionTooLarge {
                declared,
                max: self.max_option_size,
            }
            .into());
        }
        if chunk.len() > declared {
            return Err(ProtocolViolation::LengthMismatch {
                declared,
                actual: chunk.len(),
            }
            .into());
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(declared)?;
        buf.extend_from_slice(chunk);

        if buf.len() == declared {
            return Ok(Some(CompleteOption {
                option_type,
                payload: buf,
            }));
        }

        debug!(option = ?option_type, received = buf.len(), declared, "option split across records");
        self.in_flight = Some(InFlight {
            option_type,
            declared,
            buf,
        });
        Ok(None)
    }

    fn continue_in_flight(
        &mut self,
        option_type: OptionType,
        declared: usize,
        chunk: &[u8],
    ) -> TcplsResult<Option<CompleteOption>> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Err(ProtocolViolation::UnexpectedContinuation(option_type).into());
        };
        if in_flight.option_type != option_type || in_flight.declared != declared {
            return Err(ProtocolViolation::ConcurrentVariableLength {
                in_flight: in_flight.option_type,
                received: option_type,
            }
            .into());
        }

        let total = in_flight.buf.len() + chunk.len();
        if total > in_flight.declared {
            let declared = in_flight.declared;
            self.in_flight = None;
            return Err(ProtocolViolation::LengthMismatch {
                declared,
                actual: total,
            }
            .into());
        }
        in_flight.buf.extend_from_slice(chunk);

        if in_flight.buf.len() < in_flight.declared {
            return Ok(None);
        }
        Ok(self.in_flight.take().map(|done| CompleteOption {
            option_type: done.option_type,
            payload: done.buf,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{DEFAULT_MAX_OPTION_SIZE, MAX_PLAINTEXT_RECORD_SIZE};
    use crate::core::error::TcplsError;

    fn violation(err: TcplsError) -> ProtocolViolation {
        match err {
            TcplsError::Protocol(v) => v,
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn test_fixed_frame_layout() {
        let records = frame_option(OptionType::UserTimeout, &[0x00, 0x1e]).unwrap();
        assert_eq!(records, vec![vec![0x01, 0x00, 0x1e]]);
    }

    #[test]
    fn test_variable_frame_layout() {
        let records = frame_option(OptionType::BpfCc, b"abc").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(hex::encode(&records[0]), "0400000003616263");
    }

    #[test]
    fn test_large_option_spans_records() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        let records = frame_option(OptionType::BpfCc, &payload).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].len(), VARLEN_CHUNK + 5);
        assert_eq!(hex::encode(&records[0][..5]), "0400009c40");
        assert_eq!(hex::encode(&records[1][..5]), "0480009c40");
        assert!(records.iter().all(|r| r.len() <= MAX_PLAINTEXT_RECORD_SIZE));

        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        assert_eq!(r.push(&records[0]).unwrap(), None);
        assert_eq!(r.push(&records[1]).unwrap(), None);
        let done = r.push(&records[2]).unwrap().unwrap();
        assert_eq!(done.payload, payload);
        assert!(r.in_flight().is_none());
    }

    #[test]
    fn test_fixed_option_between_continuations() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        assert_eq!(r.push(&[0x04, 0, 0, 0, 4, 1, 2]).unwrap(), None);

        let fixed = r.push(&[0x05, 1]).unwrap().unwrap();
        assert_eq!(fixed.option_type, OptionType::Failover);

        let done = r.push(&[0x04, 0x80, 0, 0, 4, 3, 4]).unwrap().unwrap();
        assert_eq!(done.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_overrun_drops_in_flight() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        r.push(&[0x04, 0, 0, 0, 3, 1]).unwrap();

        let err = violation(r.push(&[0x04, 0x80, 0, 0, 3, 2, 3, 4]).unwrap_err());
        assert_eq!(
            err,
            ProtocolViolation::LengthMismatch {
                declared: 3,
                actual: 4
            }
        );
        assert!(r.in_flight().is_none());
    }

    #[test]
    fn test_new_option_while_in_flight_rejected() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        assert_eq!(r.push(&[0x04, 0, 0, 0, 10, 1, 2, 3]).unwrap(), None);

        let err = violation(r.push(&[0x04, 0, 0, 0, 3, 7, 8, 9]).unwrap_err());
        assert_eq!(
            err,
            ProtocolViolation::ConcurrentVariableLength {
                in_flight: OptionType::BpfCc,
                received: OptionType::BpfCc,
            }
        );
        assert_eq!(r.in_flight(), Some((OptionType::BpfCc, 3, 10)));

        // A continuation declaring another length belongs to no option in flight.
        let err = violation(r.push(&[0x04, 0x80, 0, 0, 4, 7]).unwrap_err());
        assert!(matches!(err, ProtocolViolation::ConcurrentVariableLength { .. }));
        assert_eq!(r.in_flight(), Some((OptionType::BpfCc, 3, 10)));

        let done = r
            .push(&[0x04, 0x80, 0, 0, 10, 4, 5, 6, 7, 8, 9, 10])
            .unwrap()
            .unwrap();
        assert_eq!(done.payload, (1..=10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_continuation_without_first_record() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        let err = violation(r.push(&[0x04, 0x80, 0, 0, 2, 1, 2]).unwrap_err());
        assert_eq!(err, ProtocolViolation::UnexpectedContinuation(OptionType::BpfCc));
        assert!(r.in_flight().is_none());
    }

    #[test]
    fn test_declared_too_large() {
        let mut r = Reassembler::new(8);
        let err = violation(r.push(&[0x04, 0, 0, 0, 9, 1]).unwrap_err());
        assert!(matches!(err, ProtocolViolation::OptionTooLarge { declared: 9, max: 8 }));
    }

    #[test]
    fn test_unknown_tag_dropped() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        let err = violation(r.push(&[0x42, 1, 2]).unwrap_err());
        assert_eq!(err, ProtocolViolation::UnsupportedOption(0x42));
    }

    #[test]
    fn test_truncated_records() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        assert!(matches!(
            violation(r.push(&[]).unwrap_err()),
            ProtocolViolation::Truncated { .. }
        ));
        assert!(matches!(
            violation(r.push(&[0x04, 0, 0]).unwrap_err()),
            ProtocolViolation::Truncated { .. }
        ));
    }

    #[test]
    fn test_empty_variable_option_completes() {
        let mut r = Reassembler::new(DEFAULT_MAX_OPTION_SIZE);
        let done = r.push(&[0x04, 0, 0, 0, 0]).unwrap().unwrap();
        assert!(done.payload.is_empty());
    }
}
