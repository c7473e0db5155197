//! Typed packets and their binary layout.
//!
//! Every packet is `[magic:4][type:4][payload size:4][payload...]`, all
//! integers big-endian. [`Packet::from_parts`] is the factory used by the
//! codec: it picks the variant from the type ordinal and parses the
//! payload fields left to right.

use crate::error::{ProtocolError, ProtocolResult};
use crate::payload::{PayloadReader, PayloadWriter};
use crate::types::{Magic, PacketType, Priority, HEADER_LEN};
use bytes::{BufMut, Bytes, BytesMut};

/// Fields of a recurring-schedule submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

/// Packet contents, one variant per wire layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    CanDo { function: String },
    CantDo { function: String },
    ResetAbilities,
    PreSleep,
    Noop,
    /// SUBMIT_JOB, SUBMIT_JOB_BG, SUBMIT_JOB_HIGH(_BG), SUBMIT_JOB_LOW(_BG).
    SubmitJob {
        priority: Priority,
        background: bool,
        function: String,
        unique_id: String,
        data: Bytes,
    },
    SubmitJobSched {
        function: String,
        unique_id: String,
        schedule: Schedule,
        data: Bytes,
    },
    SubmitJobEpoch {
        function: String,
        unique_id: String,
        epoch: i64,
        data: Bytes,
    },
    SubmitReduceJob {
        background: bool,
        function: String,
        unique_id: String,
        reducer: String,
        data: Bytes,
    },
    JobCreated { handle: String },
    GrabJob,
    GrabJobUniq,
    GrabJobAll,
    NoJob,
    JobAssign {
        handle: String,
        function: String,
        data: Bytes,
    },
    JobAssignUniq {
        handle: String,
        function: String,
        unique_id: String,
        data: Bytes,
    },
    JobAssignAll {
        handle: String,
        function: String,
        unique_id: String,
        reducer: String,
        data: Bytes,
    },
    WorkStatus {
        handle: String,
        numerator: u32,
        denominator: u32,
    },
    WorkComplete { handle: String, data: Bytes },
    WorkFail { handle: String },
    WorkException { handle: String, data: Bytes },
    WorkData { handle: String, data: Bytes },
    WorkWarning { handle: String, data: Bytes },
    GetStatus { handle: String },
    GetStatusUnique { unique_id: String },
    EchoReq { data: Bytes },
    EchoRes { data: Bytes },
    Error { code: String, text: String },
    StatusRes {
        handle: String,
        known: bool,
        running: bool,
        numerator: u32,
        denominator: u32,
    },
    StatusResUnique {
        unique_id: String,
        known: bool,
        running: bool,
        numerator: u32,
        denominator: u32,
        waiting: u32,
    },
    SetClientId { client_id: String },
    CanDoTimeout { function: String, timeout: u32 },
    AllYours,
    OptionReq { option: String },
    OptionRes { option: String },
}

impl PacketBody {
    /// Wire type of this body.
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::CanDo { .. } => PacketType::CanDo,
            PacketBody::CantDo { .. } => PacketType::CantDo,
            PacketBody::ResetAbilities => PacketType::ResetAbilities,
            PacketBody::PreSleep => PacketType::PreSleep,
            PacketBody::Noop => PacketType::Noop,
            PacketBody::SubmitJob {
                priority,
                background,
                ..
            } => PacketType::for_submit(*priority, *background),
            PacketBody::SubmitJobSched { .. } => PacketType::SubmitJobSched,
            PacketBody::SubmitJobEpoch { .. } => PacketType::SubmitJobEpoch,
            PacketBody::SubmitReduceJob { background: false, .. } => PacketType::SubmitReduceJob,
            PacketBody::SubmitReduceJob { background: true, .. } => {
                PacketType::SubmitReduceJobBackground
            }
            PacketBody::JobCreated { .. } => PacketType::JobCreated,
            PacketBody::GrabJob => PacketType::GrabJob,
            PacketBody::GrabJobUniq => PacketType::GrabJobUniq,
            PacketBody::GrabJobAll => PacketType::GrabJobAll,
            PacketBody::NoJob => PacketType::NoJob,
            PacketBody::JobAssign { .. } => PacketType::JobAssign,
            PacketBody::JobAssignUniq { .. } => PacketType::JobAssignUniq,
            PacketBody::JobAssignAll { .. } => PacketType::JobAssignAll,
            PacketBody::WorkStatus { .. } => PacketType::WorkStatus,
            PacketBody::WorkComplete { .. } => PacketType::WorkComplete,
            PacketBody::WorkFail { .. } => PacketType::WorkFail,
            PacketBody::WorkException { .. } => PacketType::WorkException,
            PacketBody::WorkData { .. } => PacketType::WorkData,
            PacketBody::WorkWarning { .. } => PacketType::WorkWarning,
            PacketBody::GetStatus { .. } => PacketType::GetStatus,
            PacketBody::GetStatusUnique { .. } => PacketType::GetStatusUnique,
            PacketBody::EchoReq { .. } => PacketType::EchoReq,
            PacketBody::EchoRes { .. } => PacketType::EchoRes,
            PacketBody::Error { .. } => PacketType::Error,
            PacketBody::StatusRes { .. } => PacketType::StatusRes,
            PacketBody::StatusResUnique { .. } => PacketType::StatusResUnique,
            PacketBody::SetClientId { .. } => PacketType::SetClientId,
            PacketBody::CanDoTimeout { .. } => PacketType::CanDoTimeout,
            PacketBody::AllYours => PacketType::AllYours,
            PacketBody::OptionReq { .. } => PacketType::OptionReq,
            PacketBody::OptionRes { .. } => PacketType::OptionRes,
        }
    }

    /// Serializes the payload (without header).
    pub fn encode_payload(&self) -> BytesMut {
        let w = PayloadWriter::default();
        match self {
            PacketBody::CanDo { function } | PacketBody::CantDo { function } => w.last(function),
            PacketBody::ResetAbilities
            | PacketBody::PreSleep
            | PacketBody::Noop
            | PacketBody::GrabJob
            | PacketBody::GrabJobUniq
            | PacketBody::GrabJobAll
            | PacketBody::NoJob
            | PacketBody::AllYours => PayloadWriter::empty(),
            PacketBody::SubmitJob {
                function,
                unique_id,
                data,
                ..
            } => w.field(function).field(unique_id).last(data),
            PacketBody::SubmitJobSched {
                function,
                unique_id,
                schedule,
                data,
            } => w
                .field(function)
                .field(unique_id)
                .field(&schedule.minute)
                .field(&schedule.hour)
                .field(&schedule.day_of_month)
                .field(&schedule.month)
                .field(&schedule.day_of_week)
                .last(data),
            PacketBody::SubmitJobEpoch {
                function,
                unique_id,
                epoch,
                data,
            } => w
                .field(function)
                .field(unique_id)
                .field(epoch.to_string())
                .last(data),
            PacketBody::SubmitReduceJob {
                function,
                unique_id,
                reducer,
                data,
                ..
            } => w.field(function).field(unique_id).field(reducer).last(data),
            PacketBody::JobCreated { handle }
            | PacketBody::WorkFail { handle }
            | PacketBody::GetStatus { handle } => w.last(handle),
            PacketBody::JobAssign {
                handle,
                function,
                data,
            } => w.field(handle).field(function).last(data),
            PacketBody::JobAssignUniq {
                handle,
                function,
                unique_id,
                data,
            } => w.field(handle).field(function).field(unique_id).last(data),
            PacketBody::JobAssignAll {
                handle,
                function,
                unique_id,
                reducer,
                data,
            } => w
                .field(handle)
                .field(function)
                .field(unique_id)
                .field(reducer)
                .last(data),
            PacketBody::WorkStatus {
                handle,
                numerator,
                denominator,
            } => w
                .field(handle)
                .field(numerator.to_string())
                .last(denominator.to_string()),
            PacketBody::WorkComplete { handle, data }
            | PacketBody::WorkException { handle, data }
            | PacketBody::WorkData { handle, data }
            | PacketBody::WorkWarning { handle, data } => w.field(handle).last(data),
            PacketBody::GetStatusUnique { unique_id } => w.last(unique_id),
            PacketBody::EchoReq { data } | PacketBody::EchoRes { data } => w.last(data),
            PacketBody::Error { code, text } => w.field(code).last(text),
            PacketBody::StatusRes {
                handle,
                known,
                running,
                numerator,
                denominator,
            } => w
                .field(handle)
                .flag(*known)
                .flag(*running)
                .field(numerator.to_string())
                .last(denominator.to_string()),
            PacketBody::StatusResUnique {
                unique_id,
                known,
                running,
                numerator,
                denominator,
                waiting,
            } => w
                .field(unique_id)
                .flag(*known)
                .flag(*running)
                .field(numerator.to_string())
                .field(denominator.to_string())
                .last(waiting.to_string()),
            PacketBody::SetClientId { client_id } => w.last(client_id),
            PacketBody::CanDoTimeout { function, timeout } => {
                w.field(function).last(timeout.to_string())
            }
            PacketBody::OptionReq { option } | PacketBody::OptionRes { option } => w.last(option),
        }
    }

    /// Parses a payload for the given packet type.
    pub fn decode(kind: PacketType, payload: &[u8]) -> ProtocolResult<Self> {
        let mut r = PayloadReader::new(kind, payload);
        let body = match kind {
            PacketType::CanDo => PacketBody::CanDo {
                function: r.remainder_string("function")?,
            },
            PacketType::CantDo => PacketBody::CantDo {
                function: r.remainder_string("function")?,
            },
            PacketType::ResetAbilities => PacketBody::ResetAbilities,
            PacketType::PreSleep => PacketBody::PreSleep,
            PacketType::Noop => PacketBody::Noop,
            PacketType::SubmitJob
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHigh
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobLowBg => {
                let (priority, background) = match kind {
                    PacketType::SubmitJobBg => (Priority::Normal, true),
                    PacketType::SubmitJobHigh => (Priority::High, false),
                    PacketType::SubmitJobHighBg => (Priority::High, true),
                    PacketType::SubmitJobLow => (Priority::Low, false),
                    PacketType::SubmitJobLowBg => (Priority::Low, true),
                    _ => (Priority::Normal, false),
                };
                PacketBody::SubmitJob {
                    priority,
                    background,
                    function: r.string("function")?,
                    unique_id: r.string("unique_id")?,
                    data: r.remainder_bytes(),
                }
            }
            PacketType::SubmitJobSched => PacketBody::SubmitJobSched {
                function: r.string("function")?,
                unique_id: r.string("unique_id")?,
                schedule: Schedule {
                    minute: r.string("minute")?,
                    hour: r.string("hour")?,
                    day_of_month: r.string("day_of_month")?,
                    month: r.string("month")?,
                    day_of_week: r.string("day_of_week")?,
                },
                data: r.remainder_bytes(),
            },
            PacketType::SubmitJobEpoch => PacketBody::SubmitJobEpoch {
                function: r.string("function")?,
                unique_id: r.string("unique_id")?,
                epoch: r.number("epoch")?,
                data: r.remainder_bytes(),
            },
            PacketType::SubmitReduceJob | PacketType::SubmitReduceJobBackground => {
                PacketBody::SubmitReduceJob {
                    background: kind == PacketType::SubmitReduceJobBackground,
                    function: r.string("function")?,
                    unique_id: r.string("unique_id")?,
                    reducer: r.string("reducer")?,
                    data: r.remainder_bytes(),
                }
            }
            PacketType::JobCreated => PacketBody::JobCreated {
                handle: r.remainder_string("handle")?,
            },
            PacketType::GrabJob => PacketBody::GrabJob,
            PacketType::GrabJobUniq => PacketBody::GrabJobUniq,
            PacketType::GrabJobAll => PacketBody::GrabJobAll,
            PacketType::NoJob => PacketBody::NoJob,
            PacketType::JobAssign => PacketBody::JobAssign {
                handle: r.string("handle")?,
                function: r.string("function")?,
                data: r.remainder_bytes(),
            },
            PacketType::JobAssignUniq => PacketBody::JobAssignUniq {
                handle: r.string("handle")?,
                function: r.string("function")?,
                unique_id: r.string("unique_id")?,
                data: r.remainder_bytes(),
            },
            PacketType::JobAssignAll => PacketBody::JobAssignAll {
                handle: r.string("handle")?,
                function: r.string("function")?,
                unique_id: r.string("unique_id")?,
                reducer: r.string("reducer")?,
                data: r.remainder_bytes(),
            },
            PacketType::WorkStatus => PacketBody::WorkStatus {
                handle: r.string("handle")?,
                numerator: r.number("numerator")?,
                denominator: r.remainder_number("denominator")?,
            },
            PacketType::WorkComplete => PacketBody::WorkComplete {
                handle: r.string("handle")?,
                data: r.remainder_bytes(),
            },
            PacketType::WorkFail => PacketBody::WorkFail {
                handle: r.remainder_string("handle")?,
            },
            PacketType::WorkException => PacketBody::WorkException {
                handle: r.string("handle")?,
                data: r.remainder_bytes(),
            },
            PacketType::WorkData => PacketBody::WorkData {
                handle: r.string("handle")?,
                data: r.remainder_bytes(),
            },
            PacketType::WorkWarning => PacketBody::WorkWarning {
                handle: r.string("handle")?,
                data: r.remainder_bytes(),
            },
            PacketType::GetStatus => PacketBody::GetStatus {
                handle: r.remainder_string("handle")?,
            },
            PacketType::GetStatusUnique => PacketBody::GetStatusUnique {
                unique_id: r.remainder_string("unique_id")?,
            },
            PacketType::EchoReq => PacketBody::EchoReq {
                data: r.remainder_bytes(),
            },
            PacketType::EchoRes => PacketBody::EchoRes {
                data: r.remainder_bytes(),
            },
            PacketType::Error => PacketBody::Error {
                code: r.string("code")?,
                text: r.remainder_string("text")?,
            },
            PacketType::StatusRes => PacketBody::StatusRes {
                handle: r.string("handle")?,
                known: r.flag("known")?,
                running: r.flag("running")?,
                numerator: r.number("numerator")?,
                denominator: r.remainder_number("denominator")?,
            },
            PacketType::StatusResUnique => PacketBody::StatusResUnique {
                unique_id: r.string("unique_id")?,
                known: r.flag("known")?,
                running: r.flag("running")?,
                numerator: r.number("numerator")?,
                denominator: r.number("denominator")?,
                waiting: r.remainder_number("waiting")?,
            },
            PacketType::SetClientId => PacketBody::SetClientId {
                client_id: r.remainder_string("client_id")?,
            },
            PacketType::CanDoTimeout => PacketBody::CanDoTimeout {
                function: r.string("function")?,
                timeout: r.remainder_number("timeout")?,
            },
            PacketType::AllYours => PacketBody::AllYours,
            PacketType::OptionReq => PacketBody::OptionReq {
                option: r.remainder_string("option")?,
            },
            PacketType::OptionRes => PacketBody::OptionRes {
                option: r.remainder_string("option")?,
            },
        };
        Ok(body)
    }
}

/// A framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub body: PacketBody,
}

impl Packet {
    /// Creates a `\0REQ` packet.
    pub fn request(body: PacketBody) -> Self {
        Self {
            magic: Magic::Request,
            body,
        }
    }

    /// Creates a `\0RES` packet.
    pub fn response(body: PacketBody) -> Self {
        Self {
            magic: Magic::Response,
            body,
        }
    }

    /// Builds the correct variant from raw header values and payload.
    pub fn from_parts(magic: u32, kind: u32, payload: &[u8]) -> ProtocolResult<Self> {
        let magic = Magic::from_code(magic)?;
        let kind = PacketType::try_from(kind)?;
        let body = PacketBody::decode(kind, payload)?;
        Ok(Self { magic, body })
    }

    /// Parses a complete `12 + length` byte buffer.
    pub fn from_bytes(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                remaining: buf.len(),
            });
        }
        let magic = read_u32(&buf[0..4]);
        let kind = read_u32(&buf[4..8]);
        let length = read_u32(&buf[8..12]) as usize;
        let payload = &buf[HEADER_LEN..];
        if payload.len() != length {
            return Err(ProtocolError::Truncated {
                remaining: buf.len(),
            });
        }
        Self::from_parts(magic, kind, payload)
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// Serialized payload length in bytes.
    pub fn payload_size(&self) -> usize {
        self.body.encode_payload().len()
    }

    /// Appends header and payload to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let payload = self.body.encode_payload();
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(self.magic.code());
        dst.put_u32(self.packet_type().as_u32());
        // Payload sizes are bounded by the codec limit, far below u32::MAX.
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
    }

    /// Header and payload as one buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw)
}
