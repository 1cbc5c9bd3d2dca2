use tokio::sync::oneshot;

/// What a handler delivers to the waiting caller.
#[derive(Debug)]
pub enum Reply<R> {
    Ok(R),
    Error(anyhow::Error),
}

/// Reply sink of one flow. Consumed on send, so a flow can get at most one reply.
#[derive(Debug)]
pub struct ReplyTo<R> {
    sender: oneshot::Sender<Reply<R>>,
}

impl<R> ReplyTo<R> {
    /// Returns `false` if nobody waits for the reply anymore, for example after a timeout.
    pub fn send(self, reply: Reply<R>) -> bool {
        if self.sender.send(reply).is_err() {
            log::debug!("Caller is gone, late reply discarded");
            return false;
        }
        true
    }

    pub fn ok(self, reply: R) -> bool {
        self.send(Reply::Ok(reply))
    }

    pub fn error<E: Into<anyhow::Error>>(self, err: E) -> bool {
        self.send(Reply::Error(err.into()))
    }

    /// Caller stopped waiting. Long running handlers can use it to abandon work.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves when the caller stops waiting.
    pub async fn closed(&mut self) {
        self.sender.closed().await;
    }
}

pub(crate) fn channel<R>() -> (ReplyTo<R>, oneshot::Receiver<Reply<R>>) {
    let (sender, receiver) = oneshot::channel();
    (ReplyTo { sender }, receiver)
}
