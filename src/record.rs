//! The wire record and its JSON encoding.
//!
//! `Record` is a self-describing, tagged variant type: the `op` field names
//! the record kind and `serde` rejects (at decode time) any record missing a
//! field its tag requires.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op")]
pub enum Record {
    #[serde(rename = "HELLO")]
    Hello { pid: u64 },

    #[serde(rename = "HELLO_ACK")]
    HelloAck { pid: u64, round: u64, to: u64 },

    #[serde(rename = "HB")]
    Heartbeat { pid: u64 },

    #[serde(rename = "ELECTION")]
    Election { source: u64 },

    #[serde(rename = "OK")]
    Ok { to: u64 },

    #[serde(rename = "LEADER")]
    Leader { pid: u64, round: u64 },

    #[serde(rename = "START_CONSENSUS")]
    StartConsensus { round: u64 },

    #[serde(rename = "VALUE")]
    Value { pid: u64, value: u64, round: u64 },

    #[serde(rename = "RESPONSE")]
    Response { pid: u64, response: u64, round: u64 },

    #[serde(rename = "ROUND_UPDATE")]
    RoundUpdate { round: u64 },

    /// Round reconciliation: a rejoining or contested-election node asks the
    /// group what round it's on and adopts the plurality answer.
    #[serde(rename = "ROUND_QUERY")]
    RoundQuery { pid: u64 },

    #[serde(rename = "ROUND_RESPONSE")]
    RoundResponse { pid: u64, round: u64 },
}

impl Record {
    pub fn encode(&self) -> Vec<u8> {
        // Only fails on types serde_json can't represent (NaN floats, non-UTF8
        // map keys); Record contains neither, so this can't realistically fail.
        serde_json::to_vec(self).expect("Record always serializes")
    }

    /// Decodes a wire record, or `None` if malformed — the receiver logs and
    /// drops these rather than propagating an error.
    pub fn decode(bytes: &[u8]) -> Option<Record> {
        serde_json::from_slice(bytes).ok()
    }

    /// The `op` tag, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Record::Hello { .. } => "HELLO",
            Record::HelloAck { .. } => "HELLO_ACK",
            Record::Heartbeat { .. } => "HB",
            Record::Election { .. } => "ELECTION",
            Record::Ok { .. } => "OK",
            Record::Leader { .. } => "LEADER",
            Record::StartConsensus { .. } => "START_CONSENSUS",
            Record::Value { .. } => "VALUE",
            Record::Response { .. } => "RESPONSE",
            Record::RoundUpdate { .. } => "ROUND_UPDATE",
            Record::RoundQuery { .. } => "ROUND_QUERY",
            Record::RoundResponse { .. } => "ROUND_RESPONSE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_record_missing_a_required_field() {
        let raw = br#"{"op":"VALUE","pid":1,"round":0}"#; // missing "value"
        assert_eq!(Record::decode(raw), None);
    }

    #[test]
    fn rejects_unknown_op() {
        let raw = br#"{"op":"NOT_A_REAL_OP"}"#;
        assert_eq!(Record::decode(raw), None);
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert_eq!(Record::decode(b"not json at all"), None);
    }

    #[test]
    fn preserves_integer_values_exactly() {
        let r = Record::Value {
            pid: 3,
            value: 9_000_000_000, // exceeds u32, must round-trip through u64
            round: 42,
        };
        let decoded = Record::decode(&r.encode()).unwrap();
        assert_eq!(decoded, r);
    }
}
