//! SASL `EXTERNAL` authenticator stage
//!
//! Client side of the line-based handshake:
//!
//! ```text
//! C: \0AUTH EXTERNAL <hex(uid)>\r\n
//! S: DATA ...          C: DATA\r\n
//! S: OK <guid>         C: BEGIN\r\n      -> done
//! S: REJECTED / ERROR                    -> failed
//! ```
//!
//! Input is consumed one line at a time and delivery halts on the line that
//! finishes the handshake, so bytes that follow `OK` stay buffered for the
//! message stage.

use tracing::debug;

use super::pipeline::{Inbound, Stage, StageContext, StageEvent};

/// Longest line accepted from the server.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    WaitingForReply,
    Done,
}

pub struct Authenticator {
    uid: u32,
    state: AuthState,
}

impl Authenticator {
    pub const NAME: &'static str = "auth";

    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            state: AuthState::WaitingForReply,
        }
    }

    /// Initial bytes: the credentials NUL and the AUTH command.
    pub fn initial_request(&self) -> Vec<u8> {
        let mut out = vec![0u8];
        out.extend_from_slice(b"AUTH EXTERNAL ");
        out.extend_from_slice(hex::encode(self.uid.to_string()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out
    }

    fn fail(&mut self, ctx: &mut StageContext, reason: String) {
        self.state = AuthState::Done;
        ctx.emit(StageEvent::AuthFailed(reason));
        ctx.halt();
    }

    fn handle_line(&mut self, line: &str, ctx: &mut StageContext) {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "OK" => {
                let guid = rest.trim().to_string();
                debug!(%guid, "server accepted credentials");
                ctx.write(b"BEGIN\r\n");
                self.state = AuthState::Done;
                ctx.emit(StageEvent::AuthComplete { guid });
                ctx.halt();
            }
            "DATA" => ctx.write(b"DATA\r\n"),
            "REJECTED" => self.fail(ctx, format!("rejected, server offers [{}]", rest.trim())),
            "ERROR" => self.fail(ctx, format!("server error: {}", rest.trim())),
            other => self.fail(ctx, format!("unexpected command {other:?}")),
        }
    }
}

impl Stage for Authenticator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_attach(&mut self, ctx: &mut StageContext) {
        ctx.write(&self.initial_request());
    }

    fn handle_inbound(&mut self, input: &[u8], ctx: &mut StageContext) -> Inbound {
        if self.state == AuthState::Done {
            return Inbound::Pass;
        }

        let Some(end) = input.windows(2).position(|w| w == b"\r\n") else {
            if input.len() > MAX_LINE_LENGTH {
                self.fail(ctx, format!("line exceeds {MAX_LINE_LENGTH} bytes"));
            }
            return Inbound::Consumed(0);
        };
        if end > MAX_LINE_LENGTH {
            self.fail(ctx, format!("line exceeds {MAX_LINE_LENGTH} bytes"));
            return Inbound::Consumed(0);
        }

        match std::str::from_utf8(&input[..end]) {
            Ok(line) => self.handle_line(line, ctx),
            Err(_) => self.fail(ctx, "handshake line is not UTF-8".into()),
        }
        Inbound::Consumed(end + 2)
    }
}
