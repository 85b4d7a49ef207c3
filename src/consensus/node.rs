use crate::clock::Clock;
use crate::consensus::error::FatalError;
use crate::consensus::messages::Message;
use crate::consensus::state::ConsensusState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, trace, warn};

pub enum NodeCommand {
    Submit(Message),
    Shutdown,
}

/// Owns the consensus state and drives it from a single thread.
pub struct Node {
    state: ConsensusState,
    msg_tx: SyncSender<Message>,
}

impl Node {
    pub fn new(state: ConsensusState, msg_tx: SyncSender<Message>) -> Self {
        Self { state, msg_tx }
    }

    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    pub fn run(mut self, rx_cmd: mpsc::Receiver<NodeCommand>) -> Result<(), FatalError> {
        let mut shutdown = false;
        loop {
            while let Ok(cmd) = rx_cmd.try_recv() {
                match cmd {
                    NodeCommand::Submit(msg) => self.submit(msg),
                    NodeCommand::Shutdown => {
                        shutdown = true;
                    }
                }
            }

            if shutdown {
                info!(height = self.state.leader_height(), "node stopping");
                break;
            }

            if let Err(e) = self.state.step() {
                error!(error = %e, height = self.state.leader_height(), "fatal consensus error, halting");
                return Err(e);
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn submit(&mut self, msg: Message) {
        match self.msg_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(m)) => warn!(kind = m.kind(), "message queue full, dropped"),
            Err(TrySendError::Disconnected(_)) => trace!("message queue closed"),
        }
    }
}

/// Posts a local EOM tick every `period` until `shutdown` is set or the
/// queue goes away.
pub fn spawn_eom_ticker(
    msg_tx: SyncSender<Message>,
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let slice = period.min(Duration::from_millis(50));
        loop {
            let mut waited = Duration::ZERO;
            while waited < period {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(slice);
                waited += slice;
            }
            match msg_tx.try_send(Message::local_eom(clock.now_ms())) {
                Ok(()) => trace!("eom tick"),
                Err(TrySendError::Full(_)) => warn!("message queue full, eom tick dropped"),
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    })
}
