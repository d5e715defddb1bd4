//! Message vocabulary for the driver/worker protocol.
//!
//! Two disjoint opcode namespaces:
//! - **down protocol** (driver → worker): control and input data, opcodes 0-9
//! - **up protocol** (worker → driver): output, status, counters, opcodes 50-56
//!
//! Wire form per message: `<opcode: i32><field_1>...<field_n>`, no terminator.
//! The receiver derives field count and types from the opcode. Each variant
//! carries exactly its required fields, so a wrong argument count for an
//! opcode is unrepresentable.

use bytes::{Bytes, BytesMut};

use crate::wire::{self, WireCursor, WireError, WireResult};

/// Version field carried by `START`.
pub const PROTOCOL_VERSION: i32 = 0;

mod opcode {
    // down protocol
    pub const START: i32 = 0;
    pub const SET_JOB_CONF: i32 = 1;
    pub const SET_INPUT_TYPES: i32 = 2;
    pub const RUN_MAP: i32 = 3;
    pub const MAP_ITEM: i32 = 4;
    pub const RUN_REDUCE: i32 = 5;
    pub const REDUCE_KEY: i32 = 6;
    pub const REDUCE_VALUE: i32 = 7;
    pub const CLOSE: i32 = 8;
    pub const ABORT: i32 = 9;

    // up protocol
    pub const OUTPUT: i32 = 50;
    pub const PARTITIONED_OUTPUT: i32 = 51;
    pub const STATUS: i32 = 52;
    pub const PROGRESS: i32 = 53;
    pub const DONE: i32 = 54;
    pub const REGISTER_COUNTER: i32 = 55;
    pub const INCREMENT_COUNTER: i32 = 56;
}

/// Messages from the driver to the worker subprocess.
///
/// Record keys and values are opaque byte strings; their interpretation is
/// fixed by a prior `SetInputTypes`.
#[derive(Debug, Clone, PartialEq)]
pub enum DownMessage {
    Start {
        version: i32,
    },
    /// Job configuration as key/value pairs. Duplicate keys overwrite on the
    /// worker side; order is otherwise insignificant.
    SetJobConf {
        pairs: Vec<(String, String)>,
    },
    SetInputTypes {
        key_type: String,
        value_type: String,
    },
    RunMap {
        input_split: Bytes,
        num_reduces: i32,
        piped_input: bool,
    },
    MapItem {
        key: Bytes,
        value: Bytes,
    },
    RunReduce {
        num_reduces: i32,
        piped_output: bool,
    },
    ReduceKey {
        key: Bytes,
    },
    ReduceValue {
        value: Bytes,
    },
    Close,
    Abort,
}

impl DownMessage {
    pub fn opcode(&self) -> i32 {
        match self {
            Self::Start { .. } => opcode::START,
            Self::SetJobConf { .. } => opcode::SET_JOB_CONF,
            Self::SetInputTypes { .. } => opcode::SET_INPUT_TYPES,
            Self::RunMap { .. } => opcode::RUN_MAP,
            Self::MapItem { .. } => opcode::MAP_ITEM,
            Self::RunReduce { .. } => opcode::RUN_REDUCE,
            Self::ReduceKey { .. } => opcode::REDUCE_KEY,
            Self::ReduceValue { .. } => opcode::REDUCE_VALUE,
            Self::Close => opcode::CLOSE,
            Self::Abort => opcode::ABORT,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        wire::put_int(dst, self.opcode());
        match self {
            Self::Start { version } => wire::put_int(dst, *version),
            Self::SetJobConf { pairs } => {
                // Count of following strings, not of pairs.
                wire::put_int(dst, (pairs.len() * 2) as i32);
                for (key, value) in pairs {
                    wire::put_text(dst, key);
                    wire::put_text(dst, value);
                }
            }
            Self::SetInputTypes {
                key_type,
                value_type,
            } => {
                wire::put_text(dst, key_type);
                wire::put_text(dst, value_type);
            }
            Self::RunMap {
                input_split,
                num_reduces,
                piped_input,
            } => {
                wire::put_bytes(dst, input_split);
                wire::put_int(dst, *num_reduces);
                wire::put_bool(dst, *piped_input);
            }
            Self::MapItem { key, value } => {
                wire::put_bytes(dst, key);
                wire::put_bytes(dst, value);
            }
            Self::RunReduce {
                num_reduces,
                piped_output,
            } => {
                wire::put_int(dst, *num_reduces);
                wire::put_bool(dst, *piped_output);
            }
            Self::ReduceKey { key } => wire::put_bytes(dst, key),
            Self::ReduceValue { value } => wire::put_bytes(dst, value),
            Self::Close | Self::Abort => {}
        }
    }

    pub(crate) fn decode(cur: &mut WireCursor<'_>) -> WireResult<Self> {
        let opcode = cur.get_int()?;
        match opcode {
            opcode::START => Ok(Self::Start {
                version: cur.get_int()?,
            }),
            opcode::SET_JOB_CONF => {
                let count = cur.get_int()?;
                if count < 0 || count % 2 != 0 {
                    return Err(WireError::Malformed(format!(
                        "invalid job conf string count {count}"
                    )));
                }
                let pairs = (0..count / 2)
                    .map(|_| Ok((cur.get_text()?, cur.get_text()?)))
                    .collect::<WireResult<Vec<_>>>()?;
                Ok(Self::SetJobConf { pairs })
            }
            opcode::SET_INPUT_TYPES => Ok(Self::SetInputTypes {
                key_type: cur.get_text()?,
                value_type: cur.get_text()?,
            }),
            opcode::RUN_MAP => Ok(Self::RunMap {
                input_split: cur.get_bytes()?,
                num_reduces: cur.get_int()?,
                piped_input: cur.get_bool()?,
            }),
            opcode::MAP_ITEM => Ok(Self::MapItem {
                key: cur.get_bytes()?,
                value: cur.get_bytes()?,
            }),
            opcode::RUN_REDUCE => Ok(Self::RunReduce {
                num_reduces: cur.get_int()?,
                piped_output: cur.get_bool()?,
            }),
            opcode::REDUCE_KEY => Ok(Self::ReduceKey {
                key: cur.get_bytes()?,
            }),
            opcode::REDUCE_VALUE => Ok(Self::ReduceValue {
                value: cur.get_bytes()?,
            }),
            opcode::CLOSE => Ok(Self::Close),
            opcode::ABORT => Ok(Self::Abort),
            other => Err(WireError::Malformed(format!(
                "unknown down-protocol opcode {other}"
            ))),
        }
    }
}

/// Messages from the worker subprocess back to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum UpMessage {
    Output {
        key: Bytes,
        value: Bytes,
    },
    PartitionedOutput {
        partition: i32,
        key: Bytes,
        value: Bytes,
    },
    Status {
        message: String,
    },
    /// Task completion fraction. Valid range is [0.0, 1.0]; the receiver
    /// rejects anything else.
    Progress {
        fraction: f64,
    },
    Done,
    /// Registration carries no id: the driver allocates one, and both sides
    /// derive the same id from registration order.
    RegisterCounter {
        group: String,
        name: String,
    },
    IncrementCounter {
        id: i32,
        amount: i32,
    },
}

impl UpMessage {
    pub fn opcode(&self) -> i32 {
        match self {
            Self::Output { .. } => opcode::OUTPUT,
            Self::PartitionedOutput { .. } => opcode::PARTITIONED_OUTPUT,
            Self::Status { .. } => opcode::STATUS,
            Self::Progress { .. } => opcode::PROGRESS,
            Self::Done => opcode::DONE,
            Self::RegisterCounter { .. } => opcode::REGISTER_COUNTER,
            Self::IncrementCounter { .. } => opcode::INCREMENT_COUNTER,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        wire::put_int(dst, self.opcode());
        match self {
            Self::Output { key, value } => {
                wire::put_bytes(dst, key);
                wire::put_bytes(dst, value);
            }
            Self::PartitionedOutput {
                partition,
                key,
                value,
            } => {
                wire::put_int(dst, *partition);
                wire::put_bytes(dst, key);
                wire::put_bytes(dst, value);
            }
            Self::Status { message } => wire::put_text(dst, message),
            Self::Progress { fraction } => wire::put_double(dst, *fraction),
            Self::Done => {}
            Self::RegisterCounter { group, name } => {
                wire::put_text(dst, group);
                wire::put_text(dst, name);
            }
            Self::IncrementCounter { id, amount } => {
                wire::put_int(dst, *id);
                wire::put_int(dst, *amount);
            }
        }
    }

    pub(crate) fn decode(cur: &mut WireCursor<'_>) -> WireResult<Self> {
        let opcode = cur.get_int()?;
        match opcode {
            opcode::OUTPUT => Ok(Self::Output {
                key: cur.get_bytes()?,
                value: cur.get_bytes()?,
            }),
            opcode::PARTITIONED_OUTPUT => Ok(Self::PartitionedOutput {
                partition: cur.get_int()?,
                key: cur.get_bytes()?,
                value: cur.get_bytes()?,
            }),
            opcode::STATUS => Ok(Self::Status {
                message: cur.get_text()?,
            }),
            opcode::PROGRESS => Ok(Self::Progress {
                fraction: cur.get_double()?,
            }),
            opcode::DONE => Ok(Self::Done),
            opcode::REGISTER_COUNTER => Ok(Self::RegisterCounter {
                group: cur.get_text()?,
                name: cur.get_text()?,
            }),
            opcode::INCREMENT_COUNTER => Ok(Self::IncrementCounter {
                id: cur.get_int()?,
                amount: cur.get_int()?,
            }),
            other => Err(WireError::Malformed(format!(
                "unknown up-protocol opcode {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down_roundtrip(msg: DownMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut cur = WireCursor::new(&buf);
        let decoded = DownMessage::decode(&mut cur).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(cur.position(), buf.len());
    }

    fn up_roundtrip(msg: UpMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut cur = WireCursor::new(&buf);
        let decoded = UpMessage::decode(&mut cur).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(cur.position(), buf.len());
    }

    #[test]
    fn down_messages_roundtrip() {
        down_roundtrip(DownMessage::Start {
            version: PROTOCOL_VERSION,
        });
        down_roundtrip(DownMessage::SetJobConf {
            pairs: vec![
                ("mapred.job.name".to_string(), "wc".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
        });
        down_roundtrip(DownMessage::SetInputTypes {
            key_type: "Text".to_string(),
            value_type: "Text".to_string(),
        });
        down_roundtrip(DownMessage::RunMap {
            input_split: Bytes::from_static(b"hdfs://split/0"),
            num_reduces: 2,
            piped_input: true,
        });
        down_roundtrip(DownMessage::MapItem {
            key: Bytes::from_static(b"k1"),
            value: Bytes::from_static(b"v1"),
        });
        down_roundtrip(DownMessage::RunReduce {
            num_reduces: 1,
            piped_output: false,
        });
        down_roundtrip(DownMessage::ReduceKey {
            key: Bytes::from_static(b"k"),
        });
        down_roundtrip(DownMessage::ReduceValue {
            value: Bytes::new(),
        });
        down_roundtrip(DownMessage::Close);
        down_roundtrip(DownMessage::Abort);
    }

    #[test]
    fn up_messages_roundtrip() {
        up_roundtrip(UpMessage::Output {
            key: Bytes::from_static(b"k1"),
            value: Bytes::from_static(b"1"),
        });
        up_roundtrip(UpMessage::PartitionedOutput {
            partition: 3,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
        });
        up_roundtrip(UpMessage::Status {
            message: "mapping".to_string(),
        });
        up_roundtrip(UpMessage::Progress { fraction: 0.75 });
        up_roundtrip(UpMessage::Done);
        up_roundtrip(UpMessage::RegisterCounter {
            group: "wc".to_string(),
            name: "records".to_string(),
        });
        up_roundtrip(UpMessage::IncrementCounter { id: 0, amount: 10 });
    }

    #[test]
    fn set_job_conf_carries_string_count() {
        let msg = DownMessage::SetJobConf {
            pairs: vec![("a".to_string(), "1".to_string())],
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut cur = WireCursor::new(&buf);
        assert_eq!(cur.get_int().unwrap(), 1); // opcode
        assert_eq!(cur.get_int().unwrap(), 2); // two strings for one pair
    }

    #[test]
    fn odd_job_conf_count_is_malformed() {
        let mut buf = BytesMut::new();
        wire::put_int(&mut buf, 1); // SET_JOB_CONF
        wire::put_int(&mut buf, 3);
        let mut cur = WireCursor::new(&buf);
        assert!(matches!(
            DownMessage::decode(&mut cur),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn opcode_namespaces_are_disjoint() {
        // An up opcode fed to the down decoder must not be accepted.
        let mut buf = BytesMut::new();
        UpMessage::Done.encode(&mut buf);
        let mut cur = WireCursor::new(&buf);
        assert!(matches!(
            DownMessage::decode(&mut cur),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let mut buf = BytesMut::new();
        wire::put_int(&mut buf, 99);
        let mut cur = WireCursor::new(&buf);
        assert!(matches!(
            UpMessage::decode(&mut cur),
            Err(WireError::Malformed(_))
        ));
    }
}
