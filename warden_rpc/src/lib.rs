//! Wire protocol between the manager and in-VM fuzzer workers: three
//! methods (`Connect`, `NewInput`, `Poll`) as length-delimited JSON over
//! TCP, one request and one response object per call.

use serde::{Deserialize, Serialize};
use warden_core::{cover::Cover, HashMap};

pub mod conn;
pub mod server;

pub use conn::{recv_msg, send_msg, FrameError};
pub use server::{serve, Client, ClientError, Handler};

/// One corpus entry as it travels on the wire: the call that justified
/// its inclusion, the serialized program, and the cover it contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusInput {
    pub call: String,
    pub prog: Vec<u8>,
    pub cover: Cover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRes {
    pub prios: Vec<Vec<f32>>,
    /// Comma-separated list of enabled syscall ids.
    pub enabled_calls: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInputArgs {
    pub name: String,
    pub input: CorpusInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollArgs {
    pub name: String,
    pub stats: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRes {
    pub candidates: Vec<Vec<u8>>,
    pub new_inputs: Vec<CorpusInput>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Connect(ConnectArgs),
    NewInput(NewInputArgs),
    Poll(PollArgs),
}

/// Per-call response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub enum Reply<T> {
    Ok(T),
    Err(String),
}
