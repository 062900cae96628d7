/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus waits for an event before checking for shutdown again.
const EVENT_BUS_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct EventHandlers {
    pub(crate) replicate_write_handlers: Vec<HandlerPtr<ReplicateWriteEvent>>,
    pub(crate) recovered_write_handlers: Vec<HandlerPtr<RecoveredWriteEvent>>,
    pub(crate) propose_miniblock_handlers: Vec<HandlerPtr<ProposeMiniblockEvent>>,
    pub(crate) save_candidate_handlers: Vec<HandlerPtr<SaveCandidateEvent>>,
    pub(crate) promote_miniblock_handlers: Vec<HandlerPtr<PromoteMiniblockEvent>>,
    pub(crate) submit_reconcile_handlers: Vec<HandlerPtr<SubmitReconcileEvent>>,
    pub(crate) end_reconcile_handlers: Vec<HandlerPtr<EndReconcileEvent>>,
    pub(crate) seal_ephemeral_stream_handlers: Vec<HandlerPtr<SealEphemeralStreamEvent>>,
    pub(crate) abort_upload_handlers: Vec<HandlerPtr<AbortUploadEvent>>,
}

impl EventHandlers {
    /// Collect the user-defined handlers, plus the default loggers if `log_events` is set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        replicate_write_handler: Option<HandlerPtr<ReplicateWriteEvent>>,
        recovered_write_handler: Option<HandlerPtr<RecoveredWriteEvent>>,
        propose_miniblock_handler: Option<HandlerPtr<ProposeMiniblockEvent>>,
        save_candidate_handler: Option<HandlerPtr<SaveCandidateEvent>>,
        promote_miniblock_handler: Option<HandlerPtr<PromoteMiniblockEvent>>,
        submit_reconcile_handler: Option<HandlerPtr<SubmitReconcileEvent>>,
        end_reconcile_handler: Option<HandlerPtr<EndReconcileEvent>>,
        seal_ephemeral_stream_handler: Option<HandlerPtr<SealEphemeralStreamEvent>>,
        abort_upload_handler: Option<HandlerPtr<AbortUploadEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            replicate_write_handlers: handlers(log_events, replicate_write_handler),
            recovered_write_handlers: handlers(log_events, recovered_write_handler),
            propose_miniblock_handlers: handlers(log_events, propose_miniblock_handler),
            save_candidate_handlers: handlers(log_events, save_candidate_handler),
            promote_miniblock_handlers: handlers(log_events, promote_miniblock_handler),
            submit_reconcile_handlers: handlers(log_events, submit_reconcile_handler),
            end_reconcile_handlers: handlers(log_events, end_reconcile_handler),
            seal_ephemeral_stream_handlers: handlers(log_events, seal_ephemeral_stream_handler),
            abort_upload_handlers: handlers(log_events, abort_upload_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.replicate_write_handlers.is_empty()
            && self.recovered_write_handlers.is_empty()
            && self.propose_miniblock_handlers.is_empty()
            && self.save_candidate_handlers.is_empty()
            && self.promote_miniblock_handlers.is_empty()
            && self.submit_reconcile_handlers.is_empty()
            && self.end_reconcile_handlers.is_empty()
            && self.seal_ephemeral_stream_handlers.is_empty()
            && self.abort_upload_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReplicateWrite(replicate_write_event) =>
                self.replicate_write_handlers.iter().for_each(|handler| handler(&replicate_write_event)),

            Event::RecoveredWrite(recovered_write_event) =>
                self.recovered_write_handlers.iter().for_each(|handler| handler(&recovered_write_event)),

            Event::ProposeMiniblock(propose_miniblock_event) =>
                self.propose_miniblock_handlers.iter().for_each(|handler| handler(&propose_miniblock_event)),

            Event::SaveCandidate(save_candidate_event) =>
                self.save_candidate_handlers.iter().for_each(|handler| handler(&save_candidate_event)),

            Event::PromoteMiniblock(promote_miniblock_event) =>
                self.promote_miniblock_handlers.iter().for_each(|handler| handler(&promote_miniblock_event)),

            Event::SubmitReconcile(submit_reconcile_event) =>
                self.submit_reconcile_handlers.iter().for_each(|handler| handler(&submit_reconcile_event)),

            Event::EndReconcile(end_reconcile_event) =>
                self.end_reconcile_handlers.iter().for_each(|handler| handler(&end_reconcile_event)),

            Event::SealEphemeralStream(seal_ephemeral_stream_event) =>
                self.seal_ephemeral_stream_handlers.iter().for_each(|handler| handler(&seal_ephemeral_stream_event)),

            Event::AbortUpload(abort_upload_event) =>
                self.abort_upload_handlers.iter().for_each(|handler| handler(&abort_upload_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(user_handler) = user_handler {
        handlers.push(user_handler);
    }
    handlers
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(EVENT_BUS_POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
