use std::{
    fmt::Display,
    thread,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendError, Sender, TrySendError,
};

pub enum ActorOp<A: Actor> {
    Continue,
    WaitOr {
        timeout: Duration,
        timeout_msg: A::Message,
    },
    Shutdown,
}

/// Single-threaded message pump.  One thread owns the actor state and drains
/// one channel; `WaitOr` turns the next receive into a timed wait, which is
/// how timers are expressed.
pub trait Actor: Sized {
    type Message: Send + 'static;
    type Error: Display;

    fn handle(&mut self, msg: Self::Message) -> Result<ActorOp<Self>, Self::Error>;

    fn process(mut self, recv: Receiver<Self::Message>) {
        let mut op = ActorOp::Continue;
        loop {
            let msg = match op {
                ActorOp::Continue => match recv.recv() {
                    Ok(msg) => msg,
                    Err(_) => {
                        break;
                    }
                },
                ActorOp::WaitOr {
                    timeout,
                    timeout_msg,
                } => match recv.recv_timeout(timeout) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => timeout_msg,
                    Err(RecvTimeoutError::Disconnected) => {
                        break;
                    }
                },
                ActorOp::Shutdown => {
                    break;
                }
            };
            op = match self.handle(msg) {
                Ok(op) => op,
                Err(err) => {
                    log::error!("actor failed: {}", err);
                    break;
                }
            };
        }
    }

    fn spawn<F>(name: &str, cap: Capacity, factory: F) -> ActorHandle<Self::Message>
    where
        F: FnOnce(Sender<Self::Message>) -> Self + Send + 'static,
    {
        let (send, recv) = cap.to_channel();
        ActorHandle {
            sender: send.clone(),
            thread: thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    factory(send).process(recv);
                })
                .expect("Failed to spawn actor thread"),
        }
    }
}

pub struct ActorHandle<M> {
    thread: JoinHandle<()>,
    sender: Sender<M>,
}

impl<M> ActorHandle<M> {
    pub fn sender(&self) -> Sender<M> {
        self.sender.clone()
    }

    pub fn join(self) {
        let _ = self.thread.join();
    }

    pub fn send(&self, msg: M) -> Result<(), SendError<M>> {
        self.sender.send(msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), TrySendError<M>> {
        self.sender.try_send(msg)
    }
}

pub enum Capacity {
    Sync,
    Bounded(usize),
    Unbounded,
}

impl Capacity {
    pub fn to_channel<T>(&self) -> (Sender<T>, Receiver<T>) {
        match self {
            Capacity::Sync => bounded(0),
            Capacity::Bounded(cap) => bounded(*cap),
            Capacity::Unbounded => unbounded(),
        }
    }
}
