//! # Dispatcher
//!
//! Entry point for every inbound request. The dispatcher compares the epoch a request is tagged
//! with against the current epoch and picks one of two handler factories:
//!
//! - `request.epoch <= current` goes to the *present* handler,
//! - `request.epoch > current` goes to the *future* handler, the request is ahead of what this
//!   node knows and the handler must be prepared for it being premature.
//!
//! A request tagged with exactly the current epoch is always a present request. Transports rely
//! on that when they tag requests with the epoch they observed last.
//!
//! The choice is made at dispatch time. Flows which are already running keep the epoch they were
//! bound to when the clock advances.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::FlowConfiguration;
use crate::epoch::{Epoch, EpochClock};
use crate::flow::controller::PulseController;
use crate::flow::reply::ReplyTo;
use crate::flow::{self, Flow, Handle};

/// Request as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<P> {
    pub epoch: Epoch,
    pub payload: P,
}

impl<P> Request<P> {
    pub fn new(epoch: Epoch, payload: P) -> Self {
        Self { epoch, payload }
    }
}

/// Request together with the sink its handler must reply to.
#[derive(Debug)]
pub struct Message<P, R> {
    pub epoch: Epoch,
    pub payload: P,
    pub reply_to: ReplyTo<R>,
}

/// Handler factory supplied by the application layer.
pub type MakeHandle<P, R> = Arc<dyn Fn(Message<P, R>) -> Handle + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Present,
    Future,
}

impl Route {
    pub fn select(request_epoch: Epoch, current: Epoch) -> Route {
        if request_epoch > current {
            Route::Future
        } else {
            Route::Present
        }
    }
}

struct Handles<P, R> {
    present: MakeHandle<P, R>,
    future: MakeHandle<P, R>,
}

struct Inner<P, R> {
    handles: Handles<P, R>,
    clock: Arc<EpochClock>,
    controller: PulseController,
    reply_timeout: Duration,
}

pub struct Dispatcher<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for Dispatcher<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, R> Dispatcher<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(
        clock: Arc<EpochClock>,
        present: MakeHandle<P, R>,
        future: MakeHandle<P, R>,
        config: &FlowConfiguration,
    ) -> Self {
        Self::with_timeout(clock, present, future, config.reply_timeout())
    }

    pub fn with_timeout(
        clock: Arc<EpochClock>,
        present: MakeHandle<P, R>,
        future: MakeHandle<P, R>,
        reply_timeout: Duration,
    ) -> Self {
        log::debug!(
            "New dispatcher at epoch {}, reply timeout {reply_timeout:?}",
            clock.current()
        );
        let inner = Inner {
            handles: Handles { present, future },
            clock,
            controller: PulseController::new(),
            reply_timeout,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Handles a confirmed epoch advance.
    ///
    /// Live flows are notified only when the clock actually moved. Duplicates and regressions
    /// are ignored by the clock.
    pub fn change_pulse(&self, epoch: Epoch) {
        if self.inner.clock.advance(epoch) {
            log::debug!(
                "Pulse {epoch}, notifying {} live flows",
                self.inner.controller.live_flows()
            );
            self.inner.controller.pulse();
        }
    }

    pub fn current_epoch(&self) -> Epoch {
        self.inner.clock.current()
    }

    pub fn live_flows(&self) -> usize {
        self.inner.controller.live_flows()
    }

    pub fn route(&self, request_epoch: Epoch) -> Route {
        Route::select(request_epoch, self.inner.clock.current())
    }

    /// Runs the request through the present or future handler and returns its reply.
    ///
    /// A request which got no reply fails with [flow::FlowError::HandlerTimeout] when the reply
    /// timeout elapsed or with [flow::FlowError::NoReply] when the handler finished without
    /// replying. Transports should treat both as the same no reply failure.
    pub async fn dispatch(&self, request: Request<P>) -> flow::Result<R> {
        let current = self.inner.clock.current();
        let route = Route::select(request.epoch, current);
        log::trace!(
            "Dispatching request for epoch {} at epoch {current} to {route:?} handler",
            request.epoch
        );

        let make_handle = match route {
            Route::Present => &self.inner.handles.present,
            Route::Future => &self.inner.handles.future,
        };

        let (flow, reply_to) = Flow::new(
            request.epoch,
            &self.inner.controller,
            self.inner.reply_timeout,
        );
        let handle = make_handle(Message {
            epoch: request.epoch,
            payload: request.payload,
            reply_to,
        });

        flow.run(handle).await
    }

    /// Dispatches the request in the background. Failures are only logged.
    pub fn spawn(&self, request: Request<P>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let epoch = request.epoch;
            if let Err(err) = dispatcher.dispatch(request).await {
                log::error!("Handling request for epoch {epoch} failed: {err}");
            }
        })
    }
}
