// packages/engine/src/runtime/pending.rs
//! FIFO of requests awaiting a response
//!
//! The wire protocol has no request identifiers: the Nth response belongs to
//! the Nth request written. Enqueueing the reply slot and handing the frame
//! to the writer task therefore happen under one lock, so the order of the
//! queue always equals the order of frames on the kernel's stdin.
//!
//! ```text
//! caller ──push──► [ lock: slots.push_back + outbound.send ] ──► writer task ──► stdin
//! reader ──pop───► [ lock: slots.pop_front ]                  ◄── stdout
//! ```
//!
//! The lock only guards in-memory state. No I/O ever happens while it is held.

use crate::runtime::session::{EvaluationOutput, ResultShape};
use crate::runtime::state::{SessionState, StateCell};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Reply channel for one outstanding request
pub type ReplySender = oneshot::Sender<Result<EvaluationOutput>>;

/// One outstanding request
#[derive(Debug)]
pub struct PendingSlot {
    /// Form the caller asked for
    pub shape: ResultShape,

    /// Where the response goes
    pub reply: ReplySender,

    /// When the frame was queued
    pub submitted_at: Instant,
}

impl PendingSlot {
    pub fn new(shape: ResultShape, reply: ReplySender) -> Self {
        Self {
            shape,
            reply,
            submitted_at: Instant::now(),
        }
    }
}

struct Inner {
    slots: VecDeque<PendingSlot>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    closed: bool,
}

/// Shared between callers (push) and the read loop (pop)
pub struct PendingQueue {
    inner: Mutex<Inner>,
    state: Arc<StateCell>,
}

impl PendingQueue {
    pub fn new(state: Arc<StateCell>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::new(),
                outbound: None,
                closed: false,
            }),
            state,
        }
    }

    /// Attach the writer task's channel once the kernel is ready
    pub fn open(&self, outbound: mpsc::UnboundedSender<Bytes>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(EngineError::SessionTerminated);
        }
        inner.outbound = Some(outbound);
        Ok(())
    }

    /// Queue `frame` for writing and register its reply slot
    ///
    /// Returns the number of requests now outstanding. Fails with
    /// `SessionTerminated` once terminate has closed the queue, and with
    /// `SessionUnavailable` when the session is not started or crashed.
    pub fn push(&self, frame: Bytes, slot: PendingSlot) -> Result<usize> {
        let mut inner = self.inner.lock();

        let state = self.state.get();
        if inner.closed {
            // closed by anything but a crash means terminate was called
            return Err(match state {
                SessionState::Crashed => EngineError::unavailable(state),
                _ => EngineError::SessionTerminated,
            });
        }
        if !state.accepts_requests() {
            return Err(EngineError::unavailable(state));
        }
        let outbound = match inner.outbound.as_ref() {
            Some(outbound) => outbound,
            None => return Err(EngineError::unavailable(state)),
        };
        if outbound.send(frame).is_err() {
            // writer task is gone; the read loop will report why
            return Err(EngineError::unavailable(state));
        }

        inner.slots.push_back(slot);
        if inner.slots.len() == 1 {
            self.state
                .compare_transition(SessionState::Ready, SessionState::Evaluating);
        }
        Ok(inner.slots.len())
    }

    /// Take the oldest outstanding request
    pub fn pop(&self) -> Option<PendingSlot> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.pop_front();
        if slot.is_some() && inner.slots.is_empty() {
            self.state
                .compare_transition(SessionState::Evaluating, SessionState::Ready);
        }
        slot
    }

    /// Stop accepting requests and hand back everything outstanding
    ///
    /// Moves the session to `next` unless it already reached a terminal
    /// state. Only the first call gets `Some`; later calls return `None`.
    /// Dropping the outbound sender lets the writer task finish.
    pub fn close(&self, next: SessionState) -> Option<Vec<PendingSlot>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.closed = true;
        inner.outbound = None;

        if let Err(current) = self.state.transition(next) {
            tracing::debug!(%current, %next, "Session state left unchanged on close");
        }
        Some(inner.slots.drain(..).collect())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_queue() -> (PendingQueue, Arc<StateCell>, mpsc::UnboundedReceiver<Bytes>) {
        let state = Arc::new(StateCell::new());
        state.transition(SessionState::Starting).unwrap();
        state.transition(SessionState::Ready).unwrap();

        let queue = PendingQueue::new(Arc::clone(&state));
        let (tx, rx) = mpsc::unbounded_channel();
        queue.open(tx).unwrap();
        (queue, state, rx)
    }

    fn slot() -> (PendingSlot, oneshot::Receiver<Result<EvaluationOutput>>) {
        let (tx, rx) = oneshot::channel();
        (PendingSlot::new(ResultShape::Decoded, tx), rx)
    }

    #[test]
    fn test_push_before_open_is_unavailable() {
        let state = Arc::new(StateCell::new());
        let queue = PendingQueue::new(state);
        let (s, _rx) = slot();
        let err = queue.push(Bytes::from_static(b"8:C\x01"), s).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SessionUnavailable {
                state: SessionState::NotStarted,
                ..
            }
        ));
    }

    #[test]
    fn test_frames_and_slots_stay_in_step() {
        let (queue, state, mut rx) = ready_queue();

        for i in 0..3u8 {
            let (s, _rx) = slot();
            let depth = queue.push(Bytes::from(vec![i]), s).unwrap();
            assert_eq!(depth, usize::from(i) + 1);
        }
        assert_eq!(state.get(), SessionState::Evaluating);

        for i in 0..3u8 {
            assert_eq!(rx.try_recv().unwrap().as_ref(), &[i]);
        }

        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
        assert_eq!(state.get(), SessionState::Evaluating);
        assert!(queue.pop().is_some());
        assert_eq!(state.get(), SessionState::Ready);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_close_drains_once() {
        let (queue, state, mut rx) = ready_queue();
        let (s1, _r1) = slot();
        let (s2, _r2) = slot();
        queue.push(Bytes::from_static(b"a"), s1).unwrap();
        queue.push(Bytes::from_static(b"b"), s2).unwrap();

        let drained = queue.close(SessionState::Crashed).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(state.get(), SessionState::Crashed);
        assert!(queue.close(SessionState::Terminating).is_none());

        let (s3, _r3) = slot();
        assert!(matches!(
            queue.push(Bytes::from_static(b"c"), s3),
            Err(EngineError::SessionUnavailable {
                state: SessionState::Crashed,
                ..
            })
        ));

        // sender dropped on close
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_push_after_terminate_is_terminated() {
        let (queue, state, _rx) = ready_queue();
        let (s1, _r1) = slot();
        queue.push(Bytes::from_static(b"a"), s1).unwrap();

        assert_eq!(queue.close(SessionState::Terminating).unwrap().len(), 1);
        assert_eq!(state.get(), SessionState::Terminating);

        let (s2, _r2) = slot();
        assert!(matches!(
            queue.push(Bytes::from_static(b"b"), s2),
            Err(EngineError::SessionTerminated)
        ));

        state.transition(SessionState::Terminated).unwrap();
        let (s3, _r3) = slot();
        assert!(matches!(
            queue.push(Bytes::from_static(b"c"), s3),
            Err(EngineError::SessionTerminated)
        ));
    }

    #[test]
    fn test_open_after_close_refused() {
        let state = Arc::new(StateCell::new());
        state.transition(SessionState::Starting).unwrap();
        let queue = PendingQueue::new(Arc::clone(&state));

        assert!(queue.close(SessionState::Terminating).unwrap().is_empty());
        assert_eq!(state.get(), SessionState::Terminating);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(queue.open(tx), Err(EngineError::SessionTerminated)));
    }

    #[test]
    fn test_concurrent_pushes_match_frame_order() {
        use std::thread;

        let (queue, _state, mut rx) = ready_queue();
        let queue = Arc::new(queue);

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut receivers = Vec::new();
                    for i in 0..25u8 {
                        let (tx, rx) = oneshot::channel();
                        queue
                            .push(
                                Bytes::from(vec![t, i]),
                                PendingSlot::new(ResultShape::Raw, tx),
                            )
                            .unwrap();
                        receivers.push((vec![t, i], rx));
                    }
                    receivers
                })
            })
            .collect();
        let receivers: Vec<_> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        // echo each frame back through the oldest slot
        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            let slot = queue.pop().unwrap();
            slot.reply.send(Ok(EvaluationOutput::Raw(frame))).ok();
            count += 1;
        }
        assert_eq!(count, 100);
        assert!(queue.is_empty());

        for (expected, mut reply) in receivers {
            match reply.try_recv().unwrap() {
                Ok(EvaluationOutput::Raw(bytes)) => assert_eq!(bytes.as_ref(), expected.as_slice()),
                _ => panic!("reply for {:?} missing", expected),
            }
        }
    }
}
