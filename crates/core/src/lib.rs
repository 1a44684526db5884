#![doc = include_str!("../README.md")]

pub mod cmd;
pub mod format;
pub mod handle;
pub mod metrics;
pub mod poll;

pub mod prelude {
    pub use crate::{
        cmd::{CmdSender, CmdThread, ThreadSpawnError},
        format::{FourCc, Resolution, StreamFormat, StreamType},
        handle::{Handle, HandleArena},
        metrics::MatchCounters,
        poll::{CallMode, PollNotify, PollThread, Readiness},
    };
}
