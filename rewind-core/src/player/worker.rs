use crossbeam_channel::Sender;

use crate::{
    actor::{Actor, ActorOp},
    error::Error,
    source::{BackfillRequest, IterItem, IterateRequest, Message, MessageIter, MessageSource,
        Progress},
    time::Timestamp,
    util::CancelToken,
};

use super::PlayerEvent;

/// Work orders for the source worker.  Processed strictly in order, so a
/// `Reset` followed by an `Advance` always advances the fresh iterator.
pub enum SourceRequest {
    Initialize {
        generation: u64,
    },
    Backfill {
        topics: Vec<String>,
        time: Timestamp,
        cancel: CancelToken,
        generation: u64,
    },
    Reset {
        start: Timestamp,
        topics: Vec<String>,
        generation: u64,
    },
    Advance {
        until: Timestamp,
        cancel: CancelToken,
        generation: u64,
    },
    Quit,
}

pub struct AdvanceOutcome {
    pub batch: Vec<Message>,
    pub reached: Timestamp,
    pub end_of_stream: bool,
    pub progress: Progress,
}

/// Owns the message source and the single live iterator on behalf of the
/// player.  Results go back as events tagged with the generation that issued
/// them; the player drops anything stale.
pub struct SourceWorker {
    source: Box<dyn MessageSource>,
    iter: Option<MessageIter>,
    // First message past the previous advance window, kept for the next one.
    lookahead: Option<Message>,
    exhausted: bool,
    events: Sender<PlayerEvent>,
}

impl SourceWorker {
    pub fn new(source: Box<dyn MessageSource>, events: Sender<PlayerEvent>) -> SourceWorker {
        SourceWorker {
            source,
            iter: None,
            lookahead: None,
            exhausted: false,
            events,
        }
    }

    fn advance(
        &mut self,
        until: Timestamp,
        cancel: CancelToken,
        generation: u64,
    ) -> Result<(), Error> {
        let mut batch = Vec::new();
        let mut blocked = false;
        let mut failure = None;

        if let Some(msg) = self.lookahead.take() {
            if msg.receive_time <= until {
                batch.push(msg);
            } else {
                self.lookahead = Some(msg);
                blocked = true;
            }
        }

        if !blocked && !self.exhausted {
            match self.iter.as_mut() {
                Some(iter) => loop {
                    if cancel.is_cancelled() {
                        // Superseded; the issuing generation is gone, so
                        // nobody wants a reply.
                        return Ok(());
                    }
                    match iter.next() {
                        None => {
                            self.exhausted = true;
                            break;
                        }
                        Some(Ok(IterItem::Message(msg))) => {
                            if msg.receive_time <= until {
                                batch.push(msg);
                            } else {
                                self.lookahead = Some(msg);
                                break;
                            }
                        }
                        Some(Ok(IterItem::Stamp(stamp))) => {
                            if stamp >= until {
                                break;
                            }
                        }
                        Some(Ok(IterItem::Problem {
                            connection_id,
                            severity,
                            message,
                        })) => {
                            self.events.send(PlayerEvent::SourceProblem {
                                connection_id,
                                severity,
                                message,
                            })?;
                        }
                        Some(Err(err)) => {
                            failure = Some(err);
                            break;
                        }
                    }
                },
                None => {
                    log::warn!("advance requested without an iterator");
                }
            }
        }

        let result = match failure {
            Some(err) => Err(err),
            None => Ok(AdvanceOutcome {
                batch,
                reached: until,
                end_of_stream: self.exhausted && self.lookahead.is_none(),
                progress: self.source.progress(),
            }),
        };
        self.events.send(PlayerEvent::Advanced { result, generation })?;
        Ok(())
    }
}

impl Actor for SourceWorker {
    type Message = SourceRequest;
    type Error = Error;

    fn handle(&mut self, msg: SourceRequest) -> Result<ActorOp<Self>, Error> {
        match msg {
            SourceRequest::Initialize { generation } => {
                let result = self.source.initialize();
                self.events
                    .send(PlayerEvent::Initialized { result, generation })?;
                Ok(ActorOp::Continue)
            }
            SourceRequest::Backfill {
                topics,
                time,
                cancel,
                generation,
            } => {
                let result = self.source.backfill(BackfillRequest {
                    topics,
                    time,
                    cancel: Some(cancel),
                });
                match result {
                    Err(Error::Aborted) => {
                        // A newer request superseded this pass; stay silent.
                        log::debug!("backfill at {:?} aborted", time);
                    }
                    result => {
                        let progress = self.source.progress();
                        self.events.send(PlayerEvent::BackfillLoaded {
                            result,
                            time,
                            progress,
                            generation,
                        })?;
                    }
                }
                Ok(ActorOp::Continue)
            }
            SourceRequest::Reset {
                start,
                topics,
                generation,
            } => {
                // Drop the old iterator before creating its replacement.
                self.iter = None;
                self.lookahead = None;
                self.exhausted = false;
                let result = self
                    .source
                    .iterate(IterateRequest {
                        topics,
                        start: Some(start),
                        end: None,
                        reverse: false,
                    })
                    .map(|iter| {
                        self.iter = Some(iter);
                    });
                self.events
                    .send(PlayerEvent::IteratorReset { result, generation })?;
                Ok(ActorOp::Continue)
            }
            SourceRequest::Advance {
                until,
                cancel,
                generation,
            } => {
                self.advance(until, cancel, generation)?;
                Ok(ActorOp::Continue)
            }
            SourceRequest::Quit => Ok(ActorOp::Shutdown),
        }
    }
}

impl Drop for SourceWorker {
    fn drop(&mut self) {
        self.iter = None;
        self.source.terminate();
    }
}
