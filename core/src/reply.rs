// Host-side proxy for answering an incoming call
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tether_caps::Payload;
use tracing::debug;

use crate::agent::Reply;
use crate::{Result, TetherError};

/// Write-once response builder handed to method callbacks.
///
/// Writes are forwarded synchronously to the agent's reply in call order.
/// After [`end`](Self::end) every further write fails with
/// [`TetherError::ReplyEnded`]. Clones share the same state, so a callback may
/// keep a clone and answer later from the host thread.
#[derive(Clone)]
pub struct ReplyProxy {
    inner: Arc<Inner>,
}

struct Inner {
    reply: Arc<dyn Reply>,
    // true once `end` went through
    ended: Mutex<bool>,
}

impl ReplyProxy {
    pub fn new(reply: Arc<dyn Reply>) -> Self {
        Self {
            inner: Arc::new(Inner {
                reply,
                ended: Mutex::new(false),
            }),
        }
    }

    pub fn write_code(&self, code: i32) -> Result<()> {
        let ended = self.inner.ended.lock().unwrap_or_else(PoisonError::into_inner);
        if *ended {
            return Err(TetherError::ReplyEnded);
        }
        self.inner.reply.write_code(code);
        Ok(())
    }

    pub fn write_data(&self, payload: Payload) -> Result<()> {
        let caps = payload.into_caps()?;
        let ended = self.inner.ended.lock().unwrap_or_else(PoisonError::into_inner);
        if *ended {
            return Err(TetherError::ReplyEnded);
        }
        self.inner.reply.write_data(Some(caps));
        Ok(())
    }

    /// Finalize and send the response.
    ///
    /// An unencodable payload fails before anything is sent, leaving the
    /// reply open.
    pub fn end(&self, code: i32, payload: Option<Payload>) -> Result<()> {
        let caps = payload.map(Payload::into_caps).transpose()?;
        let mut ended = self.inner.ended.lock().unwrap_or_else(PoisonError::into_inner);
        if *ended {
            return Err(TetherError::ReplyEnded);
        }
        self.inner.reply.end(code, caps);
        *ended = true;
        debug!(code, "Reply sent");
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ReplyProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyProxy")
            .field("ended", &self.is_ended())
            .finish()
    }
}
