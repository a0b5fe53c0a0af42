use comms::msg::{Msg, MsgKind};

use crate::error::{FacilitatorErr, Result};

/// Handles one inbound message to completion over the context `C`, yielding at most
/// one outbound message.
pub type Handler<C> = for<'a> fn(&mut C, Msg<'a>) -> Result<Option<Msg<'static>>>;

/// A complete mapping from every inbound `MsgKind` to its handler.
pub struct HandlerTable<C> {
    handlers: [Option<Handler<C>>; MsgKind::COUNT],
}

impl<C> HandlerTable<C> {
    /// Starts registering the handlers of a new table.
    pub fn builder() -> HandlerTableBuilder<C> {
        HandlerTableBuilder {
            handlers: [None; MsgKind::COUNT],
        }
    }

    /// Returns the handler for `kind`, `None` for kinds never sent to this process.
    pub fn get(&self, kind: MsgKind) -> Option<Handler<C>> {
        self.handlers[kind.index()]
    }
}

/// Collects handlers and checks the resulting table is complete.
pub struct HandlerTableBuilder<C> {
    handlers: [Option<Handler<C>>; MsgKind::COUNT],
}

impl<C> HandlerTableBuilder<C> {
    /// Registers `handler` for `kind`.
    ///
    /// # Errors
    /// Fails if `kind` is not inbound or already has a handler.
    pub fn register(mut self, kind: MsgKind, handler: Handler<C>) -> Result<Self> {
        if !kind.is_inbound() {
            return Err(FacilitatorErr::NotInbound(kind));
        }

        let slot = &mut self.handlers[kind.index()];
        if slot.is_some() {
            return Err(FacilitatorErr::DuplicateHandler(kind));
        }

        *slot = Some(handler);
        Ok(self)
    }

    /// Finishes the table.
    ///
    /// # Errors
    /// Fails with the first inbound kind left without a handler.
    pub fn build(self) -> Result<HandlerTable<C>> {
        if let Some(kind) = MsgKind::ALL
            .into_iter()
            .find(|kind| kind.is_inbound() && self.handlers[kind.index()].is_none())
        {
            return Err(FacilitatorErr::MissingHandler(kind));
        }

        Ok(HandlerTable {
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(usize);

    fn count(counter: &mut Counter, _msg: Msg<'_>) -> Result<Option<Msg<'static>>> {
        counter.0 += 1;
        Ok(None)
    }

    fn inbound() -> impl Iterator<Item = MsgKind> {
        MsgKind::ALL.into_iter().filter(|kind| kind.is_inbound())
    }

    #[test]
    fn complete_table_dispatches_by_kind() {
        let table = inbound()
            .try_fold(HandlerTable::<Counter>::builder(), |b, kind| b.register(kind, count))
            .and_then(HandlerTableBuilder::build)
            .unwrap();

        let mut counter = Counter::default();
        let msg = Msg::signal(MsgKind::C2fValidationMode, 2, 1).unwrap();
        let handler = table.get(MsgKind::C2fValidationMode).unwrap();
        handler(&mut counter, msg).unwrap();

        assert_eq!(counter.0, 1);
        assert!(table.get(MsgKind::F2sSendActs).is_none());
    }

    #[test]
    fn missing_handler_fails_the_build() {
        let res = inbound()
            .filter(|kind| *kind != MsgKind::S2fGrads)
            .try_fold(HandlerTable::<Counter>::builder(), |b, kind| b.register(kind, count))
            .and_then(HandlerTableBuilder::build);

        assert!(matches!(res, Err(FacilitatorErr::MissingHandler(MsgKind::S2fGrads))));
    }

    #[test]
    fn outbound_kinds_and_duplicates_are_refused() {
        let res = HandlerTable::<Counter>::builder().register(MsgKind::F2cGrads, count);
        assert!(matches!(res, Err(FacilitatorErr::NotInbound(MsgKind::F2cGrads))));

        let res = HandlerTable::<Counter>::builder()
            .register(MsgKind::C2fSendActs, count)
            .and_then(|b| b.register(MsgKind::C2fSendActs, count));
        assert!(matches!(
            res,
            Err(FacilitatorErr::DuplicateHandler(MsgKind::C2fSendActs))
        ));
    }
}
