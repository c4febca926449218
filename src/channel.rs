//! One-shot PID handoff channel between the coordinator and the
//! intermediate process.
//!
//! The channel is a plain pipe carrying exactly one message: the decimal
//! host-visible PID of the container init process. Pipe semantics give the
//! happens-before guarantee this crate relies on: the write completes
//! before `recv` returns. Each side must drop its unused half right after
//! forking, otherwise a crashed writer would never produce EOF and the
//! reader would hang instead of failing.

use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result, bail};
use nix::unistd::Pid;

/// Write half, held by the intermediate process after the fork.
pub struct PidSender {
    fd: OwnedFd,
}

/// Read half, held by the coordinator after the fork.
pub struct PidReceiver {
    fd: OwnedFd,
}

/// Creates the handoff pipe. Must be called before forking so both
/// processes inherit their half.
pub fn pid_channel() -> Result<(PidSender, PidReceiver)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe().context("failed to create the PID handoff pipe")?;
    Ok((PidSender { fd: write_fd }, PidReceiver { fd: read_fd }))
}

impl PidSender {
    /// Sends the single PID message and closes the write end.
    ///
    /// Consuming `self` enforces the one-shot contract: a sender cannot
    /// write twice, and dropping it unused closes the pipe so the reader
    /// sees EOF instead of blocking forever.
    pub fn send(self, pid: Pid) -> Result<()> {
        let payload = pid.as_raw().to_string();
        nix::unistd::write(&self.fd, payload.as_bytes())
            .context("failed to write the container PID to the handoff pipe")?;
        Ok(())
    }
}

impl PidReceiver {
    /// Blocks until the PID message arrives and returns it.
    ///
    /// EOF before any byte (the writer died or dropped its sender without
    /// sending) and non-numeric payloads are both fatal: the coordinator
    /// cannot configure cgroups or networking for an unknown PID.
    pub fn recv(self) -> Result<Pid> {
        let mut buf = [0u8; 32];
        let n = nix::unistd::read(self.fd.as_raw_fd(), &mut buf)
            .context("failed to read from the PID handoff pipe")?;
        if n == 0 {
            bail!("handoff pipe closed before the container PID was written");
        }
        let text = std::str::from_utf8(&buf[..n])
            .context("handoff pipe carried non-UTF-8 data")?
            .trim();
        let raw: i32 = text
            .parse()
            .with_context(|| format!("handoff pipe carried a malformed PID: {text:?}"))?;
        Ok(Pid::from_raw(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_exactly_one_pid() {
        let (sender, receiver) = pid_channel().unwrap();
        sender.send(Pid::from_raw(4242)).unwrap();
        assert_eq!(receiver.recv().unwrap(), Pid::from_raw(4242));
    }

    #[test]
    fn closed_without_write_is_fatal() {
        let (sender, receiver) = pid_channel().unwrap();
        drop(sender);
        let err = receiver.recv().unwrap_err();
        assert!(err.to_string().contains("closed before"), "{err}");
    }

    #[test]
    fn malformed_payload_is_fatal() {
        let (sender, receiver) = pid_channel().unwrap();
        nix::unistd::write(&sender.fd, b"not-a-pid").unwrap();
        drop(sender);
        let err = receiver.recv().unwrap_err();
        assert!(err.to_string().contains("malformed"), "{err}");
    }
}
