//! Packet magic, type ordinals and submission priority.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of every packet header: magic, type and payload size.
pub const HEADER_LEN: usize = 12;

/// Direction marker carried in the first four header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// `\0REQ`, sent by clients and workers.
    Request,
    /// `\0RES`, sent by the broker.
    Response,
}

impl Magic {
    /// Wire value of `\0REQ`.
    pub const REQUEST_CODE: u32 = 0x0052_4551;
    /// Wire value of `\0RES`.
    pub const RESPONSE_CODE: u32 = 0x0052_4553;

    /// Returns the big-endian wire value.
    pub const fn code(self) -> u32 {
        match self {
            Magic::Request => Self::REQUEST_CODE,
            Magic::Response => Self::RESPONSE_CODE,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u32) -> ProtocolResult<Self> {
        match code {
            Self::REQUEST_CODE => Ok(Magic::Request),
            Self::RESPONSE_CODE => Ok(Magic::Response),
            other => Err(ProtocolError::UnknownMagic(other)),
        }
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Magic::Request => write!(f, "REQ"),
            Magic::Response => write!(f, "RES"),
        }
    }
}

/// Job priority chosen by the submit packet type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Served before anything else in the function's queue.
    High,
    /// Default priority.
    #[default]
    Normal,
    /// Served only when nothing else is ready.
    Low,
}

impl Priority {
    /// Every priority, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

macro_rules! packet_types {
    ($($variant:ident = $ordinal:literal => $name:literal,)*) => {
        /// Packet type ordinals. The numbering is a fixed wire contract.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum PacketType {
            $($variant = $ordinal,)*
        }

        impl PacketType {
            /// Every assigned packet type in ordinal order.
            pub const ALL: &'static [PacketType] = &[$(PacketType::$variant,)*];

            /// Looks up a type by ordinal.
            pub const fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $($ordinal => Some(PacketType::$variant),)*
                    _ => None,
                }
            }

            /// Protocol name of the packet type.
            pub const fn name(self) -> &'static str {
                match self {
                    $(PacketType::$variant => $name,)*
                }
            }
        }
    };
}

packet_types! {
    CanDo = 1 => "CAN_DO",
    CantDo = 2 => "CANT_DO",
    ResetAbilities = 3 => "RESET_ABILITIES",
    PreSleep = 4 => "PRE_SLEEP",
    Noop = 6 => "NOOP",
    SubmitJob = 7 => "SUBMIT_JOB",
    JobCreated = 8 => "JOB_CREATED",
    GrabJob = 9 => "GRAB_JOB",
    NoJob = 10 => "NO_JOB",
    JobAssign = 11 => "JOB_ASSIGN",
    WorkStatus = 12 => "WORK_STATUS",
    WorkComplete = 13 => "WORK_COMPLETE",
    WorkFail = 14 => "WORK_FAIL",
    GetStatus = 15 => "GET_STATUS",
    EchoReq = 16 => "ECHO_REQ",
    EchoRes = 17 => "ECHO_RES",
    SubmitJobBg = 18 => "SUBMIT_JOB_BG",
    Error = 19 => "ERROR",
    StatusRes = 20 => "STATUS_RES",
    SubmitJobHigh = 21 => "SUBMIT_JOB_HIGH",
    SetClientId = 22 => "SET_CLIENT_ID",
    CanDoTimeout = 23 => "CAN_DO_TIMEOUT",
    AllYours = 24 => "ALL_YOURS",
    WorkException = 25 => "WORK_EXCEPTION",
    OptionReq = 26 => "OPTION_REQ",
    OptionRes = 27 => "OPTION_RES",
    WorkData = 28 => "WORK_DATA",
    WorkWarning = 29 => "WORK_WARNING",
    GrabJobUniq = 30 => "GRAB_JOB_UNIQ",
    JobAssignUniq = 31 => "JOB_ASSIGN_UNIQ",
    SubmitJobHighBg = 32 => "SUBMIT_JOB_HIGH_BG",
    SubmitJobLow = 33 => "SUBMIT_JOB_LOW",
    SubmitJobLowBg = 34 => "SUBMIT_JOB_LOW_BG",
    SubmitJobSched = 35 => "SUBMIT_JOB_SCHED",
    SubmitJobEpoch = 36 => "SUBMIT_JOB_EPOCH",
    SubmitReduceJob = 37 => "SUBMIT_REDUCE_JOB",
    SubmitReduceJobBackground = 38 => "SUBMIT_REDUCE_JOB_BACKGROUND",
    GrabJobAll = 39 => "GRAB_JOB_ALL",
    JobAssignAll = 40 => "JOB_ASSIGN_ALL",
    GetStatusUnique = 41 => "GET_STATUS_UNIQUE",
    StatusResUnique = 42 => "STATUS_RES_UNIQUE",
}

impl PacketType {
    /// Returns the wire ordinal.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Maps a plain submit to its packet type.
    pub const fn for_submit(priority: Priority, background: bool) -> Self {
        match (priority, background) {
            (Priority::High, false) => PacketType::SubmitJobHigh,
            (Priority::High, true) => PacketType::SubmitJobHighBg,
            (Priority::Normal, false) => PacketType::SubmitJob,
            (Priority::Normal, true) => PacketType::SubmitJobBg,
            (Priority::Low, false) => PacketType::SubmitJobLow,
            (Priority::Low, true) => PacketType::SubmitJobLowBg,
        }
    }
}

impl TryFrom<u32> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        PacketType::from_u32(value).ok_or(ProtocolError::UnknownPacketType(value))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
