use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_broadcast::{broadcast, InactiveReceiver, Receiver, RecvError, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, Instrument, Span};

use crate::{accessory::AccessoryController, session::Session, transport::Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Shutdown,
}

/// Host lifecycle bus. Every session listens for [`HostEvent::Shutdown`] and
/// tears its stream down when it fires.
pub struct Lifecycle {
    events: Sender<HostEvent>,
    // keeps the channel open while no listener exists
    _inactive: InactiveReceiver<HostEvent>,
    shut_down: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (mut events, receiver) = broadcast(4);
        events.set_overflow(true);

        Lifecycle {
            events,
            _inactive: receiver.deactivate(),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn listener(&self) -> LifecycleListener {
        LifecycleListener {
            events: self.events.new_receiver(),
            shut_down: self.shut_down.clone(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Signal shutdown to all listeners, including ones created later.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Broadcasting host shutdown");

        // late listeners read the flag, so an undelivered event is fine
        if let Err(err) = self.events.try_broadcast(HostEvent::Shutdown) {
            debug!("shutdown not broadcast: {err:?}");
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LifecycleListener {
    events: Receiver<HostEvent>,
    shut_down: Arc<AtomicBool>,
}

impl LifecycleListener {
    /// Resolves once the host is shutting down.
    pub async fn shutdown(&mut self) {
        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return;
            }

            match self.events.recv().await {
                Ok(HostEvent::Shutdown) | Err(RecvError::Closed) => return,
                Err(RecvError::Overflowed(_)) => continue,
            }
        }
    }
}

/// End `session` when the host shuts down.
pub fn end_on_shutdown<T, C>(session: Session<T, C>, mut listener: LifecycleListener) -> JoinHandle<()>
where
    T: Transport,
    C: AccessoryController,
{
    tokio::spawn(
        async move {
            listener.shutdown().await;
            session.end_session().await;
        }
        .instrument(Span::current()),
    )
}
