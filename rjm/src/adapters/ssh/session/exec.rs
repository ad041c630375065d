// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::{ChannelMsg, Sig};

use crate::app::types::ExecCapture;

use super::TwoHopSession;

/// Shell convention for a process killed by a signal: 128 + signal number.
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::Custom(_) => 0,
    };
    128 + number
}

/// Folds one channel message into the capture. Returns true once the
/// channel is closed.
fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut Option<i32>,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = Some(*exit_status as i32);
            false
        }
        ChannelMsg::ExitSignal {
            signal_name,
            error_message,
            ..
        } => {
            if !error_message.is_empty() {
                err.extend_from_slice(error_message.as_bytes());
                err.push(b'\n');
            }
            err.extend_from_slice(format!("killed by signal {signal_name:?}\n").as_bytes());
            code.get_or_insert(signal_exit_code(signal_name));
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

impl TwoHopSession {
    /// Runs a command on the login node, collecting stdout, stderr and the
    /// exit code.
    pub(crate) async fn exec_capture(&self, cmd: &str) -> Result<ExecCapture> {
        let guard = self.login.lock().await;
        let handle = guard
            .as_ref()
            .filter(|h| !h.is_closed())
            .ok_or_else(|| anyhow!("ssh session to {} is closed", self.login_host))?;
        let mut chan = handle
            .channel_open_session()
            .await
            .context("open session")?;
        tracing::debug!("executing '{}'", cmd);
        chan.exec(true, cmd).await.context("exec request")?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        while let Some(msg) = chan.wait().await {
            if handle_capture_message(&msg, &mut out, &mut err, &mut code) {
                break;
            }
        }
        let _ = chan.close().await;

        let exit_code =
            code.ok_or_else(|| anyhow!("channel closed before '{cmd}' reported an exit status"))?;
        Ok(ExecCapture {
            stdout: out,
            stderr: err,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_collects_streams_and_status() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        let msgs = [
            ChannelMsg::Data {
                data: b"4242\n".to_vec().into(),
            },
            ChannelMsg::ExtendedData {
                data: b"warning\n".to_vec().into(),
                ext: 1,
            },
            ChannelMsg::ExitStatus { exit_status: 3 },
        ];
        for msg in &msgs {
            assert!(!handle_capture_message(msg, &mut out, &mut err, &mut code));
        }
        assert!(handle_capture_message(&ChannelMsg::Close, &mut out, &mut err, &mut code));
        assert_eq!(out, b"4242\n");
        assert_eq!(err, b"warning\n");
        assert_eq!(code, Some(3));
    }

    #[test]
    fn signal_without_exit_status_becomes_a_nonzero_code() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        let killed = ChannelMsg::ExitSignal {
            signal_name: Sig::KILL,
            core_dumped: false,
            error_message: String::new(),
            lang_tag: String::new(),
        };
        assert!(!handle_capture_message(&killed, &mut out, &mut err, &mut code));
        assert!(handle_capture_message(&ChannelMsg::Close, &mut out, &mut err, &mut code));
        assert_eq!(code, Some(137));
        assert!(String::from_utf8_lossy(&err).contains("KILL"));
    }

    #[test]
    fn eof_does_not_end_the_capture() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        assert!(!handle_capture_message(&ChannelMsg::Eof, &mut out, &mut err, &mut code));
        assert_eq!(code, None);
    }
}
