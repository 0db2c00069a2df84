use bytes::{Buf, BufMut, BytesMut};

/// The on-disk encoding of [`crate::types::states::JobState`] plus the
/// `Invalid` marker used by delta records to signal a deletion.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordState {
    Ready = 0,
    Delayed = 1,
    Reserved = 2,
    Buried = 3,
    Invalid = 4,
}

impl RecordState {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Ready,
            1 => Self::Delayed,
            2 => Self::Reserved,
            3 => Self::Buried,
            4 => Self::Invalid,
            _ => return None,
        })
    }
}

/// One fixed-layout WAL record. A *full* record (`tube`/`body` both
/// `Some`) completely describes a job and is written on `put`; a *delta*
/// record (`tube`/`body` both `None`) carries only the fields that changed
/// and is merged onto a previously-seen full record during replay.
///
/// Whether a record is full is determined solely by the tube name length
/// being nonzero on the wire — a full record's body may legitimately be
/// empty (an empty job body is valid), but a tube name never is.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub delay_secs: u32,
    pub ttr_secs: u32,
    pub priority: u32,
    pub created_at_ms: u64,
    pub deadline_at_ms: u64,
    pub state: RecordState,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
    pub tube: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl Record {
    pub fn is_full(&self) -> bool {
        self.tube.is_some()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.id);
        dst.put_u32(self.delay_secs);
        dst.put_u32(self.ttr_secs);
        dst.put_u32(self.priority);
        dst.put_u64(self.created_at_ms);
        dst.put_u64(self.deadline_at_ms);
        dst.put_u16(self.state as u16);
        dst.put_u32(self.reserves);
        dst.put_u32(self.timeouts);
        dst.put_u32(self.releases);
        dst.put_u32(self.buries);
        dst.put_u32(self.kicks);

        match (&self.tube, &self.body) {
            (Some(tube), Some(body)) => {
                dst.put_u32(tube.len() as u32);
                dst.put_slice(tube.as_bytes());
                dst.put_u32(body.len() as u32);
                dst.put_slice(body);
            },
            _ => {
                dst.put_u32(0);
                dst.put_u32(0);
            },
        }
    }

    /// Decodes a single record from the front of `buf`, returning the
    /// record and the number of bytes consumed. Returns `None` (consuming
    /// nothing) if `buf` doesn't hold a complete record — the caller treats
    /// this as end-of-file, per the WAL's failure semantics for an
    /// unreadable tail.
    pub fn decode(buf: &[u8]) -> Option<(Record, usize)> {
        let mut cursor: &[u8] = buf;

        if cursor.remaining() < 58 {
            return None;
        }

        let id = cursor.get_u64();
        let delay_secs = cursor.get_u32();
        let ttr_secs = cursor.get_u32();
        let priority = cursor.get_u32();
        let created_at_ms = cursor.get_u64();
        let deadline_at_ms = cursor.get_u64();
        let state = RecordState::from_u16(cursor.get_u16())?;
        let reserves = cursor.get_u32();
        let timeouts = cursor.get_u32();
        let releases = cursor.get_u32();
        let buries = cursor.get_u32();
        let kicks = cursor.get_u32();

        if cursor.remaining() < 4 {
            return None;
        }
        let tube_len = cursor.get_u32() as usize;
        if cursor.remaining() < tube_len {
            return None;
        }
        let tube_bytes = &cursor[..tube_len];
        cursor.advance(tube_len);

        if cursor.remaining() < 4 {
            return None;
        }
        let body_len = cursor.get_u32() as usize;
        if cursor.remaining() < body_len {
            return None;
        }
        let body_bytes = &cursor[..body_len];
        cursor.advance(body_len);

        let (tube, body) = if tube_len > 0 {
            (
                Some(String::from_utf8_lossy(tube_bytes).into_owned()),
                Some(body_bytes.to_vec()),
            )
        } else {
            (None, None)
        };

        let consumed = buf.len() - cursor.len();

        Some((
            Record {
                id,
                delay_secs,
                ttr_secs,
                priority,
                created_at_ms,
                deadline_at_ms,
                state,
                reserves,
                timeouts,
                releases,
                buries,
                kicks,
                tube,
                body,
            },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_record_round_trips() {
        let rec = Record {
            id: 42,
            delay_secs: 0,
            ttr_secs: 60,
            priority: 10,
            created_at_ms: 1_000,
            deadline_at_ms: 0,
            state: RecordState::Ready,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
            tube: Some("default".into()),
            body: Some(b"hello".to_vec()),
        };

        let mut buf = BytesMut::new();
        rec.encode(&mut buf);

        let (decoded, consumed) = Record::decode(&buf).expect("decode");
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.tube.as_deref(), Some("default"));
        assert_eq!(decoded.body.as_deref(), Some(&b"hello"[..]));
        assert!(decoded.is_full());
    }

    #[test]
    fn delta_record_has_no_tube_or_body() {
        let rec = Record {
            id: 7,
            delay_secs: 0,
            ttr_secs: 60,
            priority: 5,
            created_at_ms: 1_000,
            deadline_at_ms: 0,
            state: RecordState::Buried,
            reserves: 1,
            timeouts: 0,
            releases: 0,
            buries: 1,
            kicks: 0,
            tube: None,
            body: None,
        };

        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        assert_eq!(buf.len(), 66);

        let (decoded, consumed) = Record::decode(&buf).expect("decode");
        assert_eq!(consumed, 66);
        assert!(!decoded.is_full());
        assert!(decoded.tube.is_none());
        assert!(decoded.body.is_none());
    }

    #[test]
    fn truncated_tail_is_treated_as_eof() {
        let rec = Record {
            id: 1,
            delay_secs: 0,
            ttr_secs: 0,
            priority: 0,
            created_at_ms: 0,
            deadline_at_ms: 0,
            state: RecordState::Ready,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
            tube: Some("t".into()),
            body: Some(vec![1, 2, 3]),
        };

        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        buf.truncate(buf.len() - 2);

        assert!(Record::decode(&buf).is_none());
    }

    #[test]
    fn empty_body_is_still_a_full_record() {
        let rec = Record {
            id: 2,
            delay_secs: 0,
            ttr_secs: 0,
            priority: 0,
            created_at_ms: 0,
            deadline_at_ms: 0,
            state: RecordState::Ready,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
            tube: Some("t".into()),
            body: Some(vec![]),
        };

        let mut buf = BytesMut::new();
        rec.encode(&mut buf);

        let (decoded, _) = Record::decode(&buf).expect("decode");
        assert!(decoded.is_full());
        assert_eq!(decoded.body, Some(vec![]));
    }
}
