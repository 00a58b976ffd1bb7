//! Length-delimited JSON framing: a little-endian u32 length header
//! followed by one JSON object.

use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on one message; a poll response carries at most 100
/// inputs, so anything past this is a corrupt peer.
pub const MAX_MSG_LEN: usize = 64 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("oversized message: {0} bytes")]
    Oversized(usize),
}

impl FrameError {
    /// True for the errors a closing peer produces.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            )
        )
    }
}

pub fn send_msg<T: Serialize, W: Write>(writer: &mut W, msg: &T) -> Result<(), FrameError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_MSG_LEN {
        return Err(FrameError::Oversized(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn recv_msg<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T, FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MSG_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PollArgs, Request};

    #[test]
    fn framed_round_trip() {
        let mut stats = warden_core::HashMap::default();
        stats.insert("exec total".to_string(), 42u64);
        let req = Request::Poll(PollArgs {
            name: "vm-0".to_string(),
            stats,
        });

        let mut wire = Vec::new();
        send_msg(&mut wire, &req).unwrap();
        assert_eq!(
            u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize,
            wire.len() - 4
        );

        let got: Request = recv_msg(&mut wire.as_slice()).unwrap();
        match got {
            Request::Poll(args) => {
                assert_eq!(args.name, "vm-0");
                assert_eq!(args.stats["exec total"], 42);
            }
            other => panic!("wrong request: {:?}", other),
        }
    }

    #[test]
    fn truncated_frame_is_a_disconnect() {
        let mut wire = Vec::new();
        send_msg(&mut wire, &crate::ConnectArgs {
            name: "vm-1".to_string(),
        })
        .unwrap();
        wire.truncate(wire.len() - 1);
        let err = recv_msg::<crate::ConnectArgs, _>(&mut wire.as_slice()).unwrap_err();
        assert!(err.is_disconnect());
    }
}
