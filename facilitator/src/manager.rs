use std::time::Instant;

use comms::msg::{Msg, MsgKind, Payload, Rank};
use log::{debug, info, warn};

use crate::{
    bus::Bus,
    config::FacilitatorConfig,
    dispatch::{Handler, HandlerTable},
    error::{FacilitatorErr, Result, Violation},
    metrics::FacilitatorMetrics,
    session::{Phase, Session},
    trainer::Trainer,
};

/// The relay and state machine sitting between the clients and the server.
///
/// Activations from a client are pushed through the trainer's segment and
/// forwarded to the server, the server's gradients are pushed back through the
/// segment and returned to the client that sent the last activations.
pub struct FacilitatorManager<T: Trainer> {
    config: FacilitatorConfig,
    session: Session,
    trainer: T,
    metrics: FacilitatorMetrics,
    handlers: HandlerTable<Self>,
}

impl<T: Trainer> FacilitatorManager<T> {
    /// Creates a new `FacilitatorManager`.
    ///
    /// # Arguments
    /// * `config` - The facilitator's place in the group.
    /// * `trainer` - The compute unit holding the model segment.
    ///
    /// # Errors
    /// Fails if the handler table can't be completed.
    pub fn new(config: FacilitatorConfig, trainer: T) -> Result<Self> {
        let handlers = HandlerTable::<Self>::builder()
            .register(MsgKind::C2fSendActs, Self::on_send_acts)?
            .register(MsgKind::S2fGrads, Self::on_grads)?
            .register(MsgKind::C2fValidationMode, Self::on_validation_mode)?
            .register(MsgKind::C2fValidationOver, Self::on_validation_over)?
            .register(MsgKind::C2fProtocolFinished, Self::on_protocol_finished)?
            .build()?;

        Ok(Self {
            config,
            session: Session::new(),
            trainer,
            metrics: FacilitatorMetrics::default(),
            handlers,
        })
    }

    pub fn config(&self) -> &FacilitatorConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn bound_client(&self) -> Option<Rank> {
        self.session.bound_client()
    }

    pub fn is_finished(&self) -> bool {
        self.session.phase() == Phase::Finished
    }

    pub fn metrics(&self) -> &FacilitatorMetrics {
        &self.metrics
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// Processes one inbound message to completion.
    ///
    /// # Returns
    /// The message to send in response, if any.
    ///
    /// # Errors
    /// A `ProtocolViolation` if the message isn't acceptable at this point of the
    /// protocol, in which case nothing was computed and nothing must be sent. Trainer
    /// failures are `Compute` errors.
    pub fn dispatch(&mut self, msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        let (kind, sender) = (msg.kind(), msg.sender());

        let res = match self.admit(&msg) {
            Ok(handler) => handler(self, msg),
            Err(violation) => Err(self.violation(kind, sender, violation)),
        };

        if let Err(FacilitatorErr::ProtocolViolation { violation, .. }) = &res {
            self.metrics.bump_rejected();
            warn!(sender = sender; "rejected {kind} during {}: {violation}", self.phase());
        }

        res
    }

    /// Receives, dispatches and answers messages until the protocol finishes.
    ///
    /// # Returns
    /// The metrics of the session once the finish notice was sent to the server.
    ///
    /// # Errors
    /// Any failure aborts the loop, the session can't be resumed.
    pub async fn run<B: Bus + ?Sized>(&mut self, bus: &mut B) -> Result<FacilitatorMetrics> {
        info!(rank = self.config.rank(), server = self.config.server_rank(); "facilitator running");

        while !self.is_finished() {
            let msg = bus.recv().await?;
            debug!(sender = msg.sender(); "received {}", msg.kind());

            if let Some(out) = self.dispatch(msg)? {
                bus.send(&out).await?;
                debug!(receiver = out.receiver(); "sent {}", out.kind());
            }
        }

        info!(
            forwards = self.metrics.forwards,
            backwards = self.metrics.backwards,
            validations = self.metrics.validations,
            rejected = self.metrics.rejected;
            "protocol finished"
        );

        Ok(self.metrics.clone())
    }

    /// Checks the preconditions every inbound kind shares.
    fn admit(&self, msg: &Msg<'_>) -> std::result::Result<Handler<Self>, Violation> {
        if self.is_finished() {
            return Err(Violation::Finished);
        }

        if msg.receiver() != self.config.rank() {
            return Err(Violation::Misaddressed {
                receiver: msg.receiver(),
            });
        }

        let kind = msg.kind();
        let handler = self.handlers.get(kind).ok_or(Violation::OutboundKind)?;

        let allowed = if kind.is_from_client() {
            self.config.is_client(msg.sender())
        } else {
            msg.sender() == self.config.server_rank()
        };

        if !allowed {
            return Err(Violation::UnexpectedSender);
        }

        Ok(handler)
    }

    fn violation(&self, kind: MsgKind, sender: Rank, violation: Violation) -> FacilitatorErr {
        FacilitatorErr::ProtocolViolation {
            kind,
            sender,
            phase: self.phase(),
            violation,
        }
    }

    fn require(&self, msg: &Msg<'_>, expected: Phase) -> Result<()> {
        self.session
            .require(expected)
            .map_err(|v| self.violation(msg.kind(), msg.sender(), v))
    }

    fn transition(&mut self, msg: &Msg<'_>, to: Phase) -> Result<()> {
        let (kind, sender) = (msg.kind(), msg.sender());
        self.session
            .transition(to)
            .map_err(|v| self.violation(kind, sender, v))
    }

    fn to_server(&self, kind: MsgKind) -> Result<Msg<'static>> {
        Ok(Msg::signal(kind, self.config.rank(), self.config.server_rank())?)
    }

    fn on_send_acts(&mut self, msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        self.require(&msg, Phase::Training)?;

        let (kind, sender) = (msg.kind(), msg.sender());
        let Payload::Acts { acts, rank_info } = msg.into_payload() else {
            return Err(self.violation(kind, sender, Violation::MalformedPayload));
        };

        if let Some(previous) = self.session.bind(sender).filter(|p| *p != sender) {
            debug!(previous = previous, client = sender; "session rebound");
        }

        let start = Instant::now();
        let (acts, rank_info) = self
            .trainer
            .forward_pass(acts, &rank_info)
            .map_err(|source| FacilitatorErr::Compute { kind, source })?;
        self.metrics.record_forward(start.elapsed());

        debug!(client = sender, rows = acts.rows(); "forwarding activations to the server");
        let out = Msg::acts(
            MsgKind::F2sSendActs,
            self.config.rank(),
            self.config.server_rank(),
            acts,
            rank_info,
        )?;

        Ok(Some(out))
    }

    fn on_grads(&mut self, msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        self.require(&msg, Phase::Training)?;

        let (kind, sender) = (msg.kind(), msg.sender());
        let client = self
            .session
            .bound_client()
            .ok_or_else(|| self.violation(kind, sender, Violation::NoBoundClient))?;

        let Payload::Grads(grads) = msg.into_payload() else {
            return Err(self.violation(kind, sender, Violation::MalformedPayload));
        };

        let start = Instant::now();
        let grads = self
            .trainer
            .backward_pass(grads)
            .map_err(|source| FacilitatorErr::Compute { kind, source })?;
        self.metrics.record_backward(start.elapsed());

        debug!(client = client; "returning gradients to the client");
        let out = Msg::grads(MsgKind::F2cGrads, self.config.rank(), client, grads)?;

        Ok(Some(out))
    }

    fn on_validation_mode(&mut self, msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        self.require(&msg, Phase::Training)?;

        self.trainer
            .enter_eval_mode()
            .map_err(|source| FacilitatorErr::Compute {
                kind: msg.kind(),
                source,
            })?;
        self.transition(&msg, Phase::Validating)?;

        info!(client = msg.sender(); "entering validation");
        self.to_server(MsgKind::F2sValidationMode).map(Some)
    }

    fn on_validation_over(&mut self, msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        self.require(&msg, Phase::Validating)?;

        self.trainer
            .end_validation()
            .map_err(|source| FacilitatorErr::Compute {
                kind: msg.kind(),
                source,
            })?;
        self.transition(&msg, Phase::Training)?;
        self.metrics.bump_validations();

        info!(client = msg.sender(); "validation over, back to training");
        self.to_server(MsgKind::F2sValidationOver).map(Some)
    }

    fn on_protocol_finished(&mut self, msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        self.transition(&msg, Phase::Finished)?;

        info!(client = msg.sender(); "protocol finished by client");
        self.to_server(MsgKind::F2sProtocolFinished).map(Some)
    }
}
