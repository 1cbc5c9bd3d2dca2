//! # Flow
//!
//! A flow is the execution of one request. It is bound to the epoch the request was tagged
//! with when the flow started and keeps that epoch even if the clock advances while it runs.
//! A write that began under epoch N therefore keeps using the lease of epoch N.
//!
//! The handler runs in its own task. The caller waits for exactly one [Outcome]:
//!
//! 1. the handler replied,
//! 2. the handler failed before replying,
//! 3. the handler finished or dropped its [ReplyTo] without replying,
//! 4. nothing happened within the reply timeout.
//!
//! A timed out handler is not aborted. It keeps running and its late reply is discarded.
//!
//! Pulses reach flows through [PulseController]. A handler can poll
//! [FlowContext::pulse_changed], wait with [FlowContext::wait_pulse] or run a sub-step with
//! [FlowContext::procedure] which gives up when a pulse arrives.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinError;

use crate::epoch::Epoch;
use crate::flow::controller::{PulseController, PulseSignal};
use crate::flow::reply::{Reply, ReplyTo};

pub mod controller;
pub mod reply;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Handler didn't reply within {0:?}")]
    HandlerTimeout(Duration),
    #[error("No reply from handler")]
    NoReply,
    #[error("Flow bound to epoch {0} was cancelled by pulse")]
    Cancelled(Epoch),
    #[error("Handler panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Handler(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Handler of one request. Gets the flow context and runs to completion.
pub type Handle = Box<dyn FnOnce(FlowContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Boxes an async closure into a [Handle].
pub fn handler<F, Fut>(f: F) -> Handle
where
    F: FnOnce(FlowContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

#[derive(Debug)]
pub enum Outcome<R> {
    Replied(R),
    Failed(anyhow::Error),
    NoReply,
    TimedOut(Duration),
    Panicked(String),
}

impl<R> Outcome<R> {
    pub fn into_result(self) -> Result<R> {
        match self {
            Outcome::Replied(reply) => Ok(reply),
            Outcome::Failed(err) => match err.downcast::<FlowError>() {
                Ok(flow_err) => Err(flow_err),
                Err(err) => Err(FlowError::Handler(err)),
            },
            Outcome::NoReply => Err(FlowError::NoReply),
            Outcome::TimedOut(timeout) => Err(FlowError::HandlerTimeout(timeout)),
            Outcome::Panicked(msg) => Err(FlowError::Panicked(msg)),
        }
    }
}

impl<R> From<Reply<R>> for Outcome<R> {
    fn from(reply: Reply<R>) -> Self {
        match reply {
            Reply::Ok(reply) => Outcome::Replied(reply),
            Reply::Error(err) => Outcome::Failed(err),
        }
    }
}

/// What a handler sees of its flow.
#[derive(Debug)]
pub struct FlowContext {
    epoch: Epoch,
    controller: PulseController,
    signal: PulseSignal,
}

impl FlowContext {
    /// Epoch the flow was bound to when it started.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Notifies the owning controller, and through it all live flows, about a pulse.
    pub fn pulse(&self) {
        self.controller.pulse();
    }

    /// True if any pulse happened since the flow started.
    pub fn pulse_changed(&self) -> bool {
        self.signal.is_stale()
    }

    pub async fn wait_pulse(&mut self) {
        self.signal.changed().await;
    }

    /// Runs one step of the handler.
    ///
    /// A `cancelable` step is abandoned with [FlowError::Cancelled] as soon as a pulse arrives,
    /// including a pulse which arrived before the step started. Non cancelable steps always run
    /// to completion.
    pub async fn procedure<F, T>(&mut self, procedure: F, cancelable: bool) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if !cancelable {
            return Ok(procedure.await);
        }
        if self.pulse_changed() {
            return Err(FlowError::Cancelled(self.epoch));
        }

        tokio::select! {
            biased;
            output = procedure => Ok(output),
            _ = self.signal.changed() => {
                log::debug!("Procedure of flow bound to epoch {} cancelled by pulse", self.epoch);
                Err(FlowError::Cancelled(self.epoch))
            }
        }
    }
}

pub struct Flow<R> {
    context: FlowContext,
    reply_rcv: oneshot::Receiver<Reply<R>>,
    timeout: Duration,
}

impl<R: Send + 'static> Flow<R> {
    /// Creates a flow bound to `epoch` and the sink its handler replies to.
    pub fn new(
        epoch: Epoch,
        controller: &PulseController,
        timeout: Duration,
    ) -> (Self, ReplyTo<R>) {
        let (reply_to, reply_rcv) = reply::channel();
        let context = FlowContext {
            epoch,
            controller: controller.clone(),
            signal: controller.subscribe(),
        };
        let flow = Flow {
            context,
            reply_rcv,
            timeout,
        };
        (flow, reply_to)
    }

    pub fn epoch(&self) -> Epoch {
        self.context.epoch
    }

    pub fn pulse(&self) {
        self.context.pulse();
    }

    pub async fn run(self, handle: Handle) -> Result<R> {
        self.execute(handle).await.into_result()
    }

    /// Runs `handle` in its own task and waits for its single outcome.
    pub async fn execute(self, handle: Handle) -> Outcome<R> {
        let Flow {
            context,
            mut reply_rcv,
            timeout,
        } = self;
        let epoch = context.epoch;

        let mut task = tokio::spawn(handle(context));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut handler_done = false;
        let outcome = loop {
            tokio::select! {
                biased;
                reply = &mut reply_rcv => {
                    match reply {
                        Ok(reply) => break reply.into(),
                        Err(_) if handler_done => break Outcome::NoReply,
                        Err(_) => {
                            // Reply sink dropped, the handler result decides.
                            tokio::select! {
                                joined = &mut task => {
                                    break Self::handler_finished(joined).unwrap_or(Outcome::NoReply)
                                }
                                _ = &mut deadline => break Outcome::TimedOut(timeout),
                            }
                        }
                    }
                }
                joined = &mut task, if !handler_done => {
                    handler_done = true;
                    if let Some(outcome) = Self::handler_finished(joined) {
                        // A reply sent right before failing still wins.
                        break match reply_rcv.try_recv() {
                            Ok(reply) => reply.into(),
                            Err(_) => outcome,
                        };
                    }
                }
                _ = &mut deadline => break Outcome::TimedOut(timeout),
            }
        };

        if let Outcome::TimedOut(timeout) = &outcome {
            log::warn!("Flow bound to epoch {epoch} got no reply within {timeout:?}");
        }
        outcome
    }

    /// `None` when the handler returned successfully, its reply may still arrive.
    fn handler_finished(
        joined: std::result::Result<anyhow::Result<()>, JoinError>,
    ) -> Option<Outcome<R>> {
        match joined {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Outcome::Failed(err)),
            Err(err) if err.is_panic() => {
                Some(Outcome::Panicked(panic_message(err.into_panic())))
            }
            Err(_) => Some(Outcome::NoReply),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
